//! Console commands.
//!
//! This module defines the [`Command`] enum, the commands an operator types at the `botlink`
//! console, and parses them from a line of input. Link management commands start with a dot;
//! everything else describes a robot motion and becomes a [`RobotCommand`].
//!
//! # Overview
//!
//! - `.connect`, `.close`, `.state`, `.exit`: manage the link.
//! - `.raw <frames>`: send already delimited frames verbatim, e.g. `.raw E,500,40;H,20;`.
//! - `stop`
//! - `arm <up|down|center|degrees>`, `head <left|right|center|degrees>`
//! - `eyes <flash|ms ...>`
//! - `move <foot> <direction> <speed> <ms> [...]`, one group of four per segment
//! - `walk around`
//!
//! # Example
//! ```rust
//! use botlink::{Command, RobotCommand};
//!
//! let cmd: Command = "arm up".try_into().unwrap();
//! assert_eq!(cmd, Command::Robot(RobotCommand::arm(120)));
//! ```
use std::{io, str::FromStr};

use thiserror::Error;

use crate::robot::{
    ARM_CENTER, ARM_DOWN, ARM_UP, Direction, EYES_FLASH, Foot, HEAD_CENTER, HEAD_LEFT, HEAD_RIGHT,
    RobotCommand, Segment,
};

/// List of possible errors a console command can produce.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("no command provided")]
    Empty,

    #[error("failed to read command: {0}")]
    Io(#[from] io::Error),
}

/// Operator supplied commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start a new connection, replacing any current one.
    Connect,
    /// Close the link.
    Close,
    /// Print the link state.
    State,
    /// Close the link and leave the console.
    Exit,
    /// Send delimited frames as typed.
    Raw(String),
    /// Send one robot command.
    Robot(RobotCommand),
}

fn invalid(command: &str, reason: impl Into<String>) -> CommandError {
    CommandError::InvalidCommandArguments {
        command: command.to_string(),
        reason: reason.into(),
    }
}

fn number<T: FromStr>(command: &str, value: &str) -> Result<T, CommandError> {
    value
        .parse::<T>()
        .map_err(|_| invalid(command, format!("'{value}' is not a valid number")))
}

fn angle(command: &str, args: &[&str], presets: &[(&str, u32)]) -> Result<u32, CommandError> {
    let [arg] = args else {
        return Err(invalid(command, "requires exactly one position"));
    };
    match presets.iter().find(|(name, _)| name == arg) {
        Some((_, degrees)) => Ok(*degrees),
        None => number(command, arg),
    }
}

fn foot(value: &str) -> Result<Foot, CommandError> {
    match value {
        "left" | "0" => Ok(Foot::Left),
        "right" | "1" => Ok(Foot::Right),
        "both" | "2" => Ok(Foot::Both),
        other => Err(invalid("move", format!("unknown foot '{other}'"))),
    }
}

fn direction(value: &str) -> Result<Direction, CommandError> {
    match value {
        "backward" | "0" => Ok(Direction::Backward),
        "forward" | "1" => Ok(Direction::Forward),
        "left" | "2" => Ok(Direction::LeftTurn),
        "right" | "3" => Ok(Direction::RightTurn),
        other => Err(invalid("move", format!("unknown direction '{other}'"))),
    }
}

fn segments(args: &[&str]) -> Result<Vec<Segment>, CommandError> {
    if args.is_empty() || args.len() % 4 != 0 {
        return Err(invalid(
            "move",
            "requires groups of foot, direction, speed and ms. Example: move both forward 80 3000",
        ));
    }

    args.chunks_exact(4)
        .map(|group| {
            Ok(Segment::new(
                foot(group[0])?,
                direction(group[1])?,
                number("move", group[2])?,
                number("move", group[3])?,
            ))
        })
        .collect()
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let line = value.trim();
        let lowered = line.to_lowercase();
        let parts = lowered.split_whitespace().collect::<Vec<&str>>();
        let Some((&name, args)) = parts.split_first() else {
            return Err(CommandError::Empty);
        };

        let robot = match name {
            ".connect" | ".reconnect" => return Ok(Command::Connect),
            ".close" | ".disconnect" => return Ok(Command::Close),
            ".state" => return Ok(Command::State),
            ".exit" => return Ok(Command::Exit),
            ".raw" => {
                // Frames are case sensitive; take them from the original line.
                let frames = line[".raw".len()..].trim();
                if !frames.ends_with(';') {
                    return Err(invalid(
                        ".raw",
                        "frames must end with ';'. Example: .raw A,40;",
                    ));
                }
                return Ok(Command::Raw(frames.to_string()));
            }
            "stop" => RobotCommand::Stop,
            "arm" => RobotCommand::arm(angle(
                name,
                args,
                &[("up", ARM_UP), ("down", ARM_DOWN), ("center", ARM_CENTER)],
            )?),
            "head" => RobotCommand::head(angle(
                name,
                args,
                &[
                    ("left", HEAD_LEFT),
                    ("right", HEAD_RIGHT),
                    ("center", HEAD_CENTER),
                ],
            )?),
            "eyes" => match args {
                [] => return Err(invalid(name, "requires 'flash' or durations in ms")),
                ["flash"] => RobotCommand::Eyes(EYES_FLASH.to_vec()),
                durations => RobotCommand::Eyes(
                    durations
                        .iter()
                        .map(|d| number(name, d))
                        .collect::<Result<_, _>>()?,
                ),
            },
            "move" => RobotCommand::Feet(segments(args)?),
            "walk" if args == ["around"] => RobotCommand::walk_around(),
            _ => return Err(CommandError::UnrecognizedCommand(line.to_string())),
        };
        Ok(Command::Robot(robot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_from_string() {
        let inputs = vec![
            (".connect", Command::Connect),
            (".close", Command::Close),
            (".state", Command::State),
            (".exit", Command::Exit),
            ("stop", Command::Robot(RobotCommand::Stop)),
            ("ARM down", Command::Robot(RobotCommand::arm(40))),
            ("head 95", Command::Robot(RobotCommand::head(95))),
            (
                "eyes flash",
                Command::Robot(RobotCommand::Eyes(vec![500, 40, 500, 40, 500])),
            ),
            ("walk around", Command::Robot(RobotCommand::walk_around())),
        ];

        for (cmd, expected) in inputs {
            let command: Command = cmd.try_into().unwrap();
            assert_eq!(command, expected);
        }
    }

    #[test]
    fn raw_keeps_case() {
        let command: Command = ".raw E,500,40;H,20;".try_into().unwrap();

        assert_eq!(command, Command::Raw("E,500,40;H,20;".to_string()));
    }

    #[test]
    fn move_segments() {
        let command: Command = "move both forward 80 3000 left right 50 1000"
            .try_into()
            .unwrap();

        assert_eq!(
            command,
            Command::Robot(RobotCommand::Feet(vec![
                Segment::new(Foot::Both, Direction::Forward, 80, 3000),
                Segment::new(Foot::Left, Direction::RightTurn, 50, 1000),
            ]))
        );
    }

    #[test]
    #[should_panic(expected = "InvalidCommandArguments")]
    fn move_incomplete_segment() {
        let _: Command = "move both forward 80".try_into().unwrap();
    }

    #[test]
    #[should_panic(expected = "InvalidCommandArguments")]
    fn move_speed_out_of_range() {
        let _: Command = "move both forward 300 1000".try_into().unwrap();
    }

    #[test]
    #[should_panic(expected = "InvalidCommandArguments")]
    fn raw_requires_delimiter() {
        let _: Command = ".raw A,40".try_into().unwrap();
    }

    #[test]
    #[should_panic(expected = "Empty")]
    fn empty_command() {
        let _: Command = "   ".try_into().unwrap();
    }

    #[test]
    #[should_panic(expected = "UnrecognizedCommand")]
    fn unrecognized_command() {
        let _: Command = "dance".try_into().unwrap();
    }
}
