//! Typed robot commands.
//!
//! [`RobotCommand`] describes what the robot should do and converts into the [`Frame`] that
//! tells it so. The presets mirror the positions the robot's servos are calibrated for.
use crate::protocol::Frame;

pub const ARM_DOWN: u32 = 40;
pub const ARM_UP: u32 = 120;
pub const ARM_CENTER: u32 = 75;

pub const HEAD_LEFT: u32 = 20;
pub const HEAD_RIGHT: u32 = 140;
pub const HEAD_CENTER: u32 = 78;

pub const SPEED_SLOW: u8 = 50;
pub const SPEED_NORMAL: u8 = 80;
pub const SPEED_FAST: u8 = 120;

/// Blink pattern used to acknowledge the operator.
pub const EYES_FLASH: [u32; 5] = [500, 40, 500, 40, 500];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Foot {
    Left = 0,
    Right = 1,
    Both = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Backward = 0,
    Forward = 1,
    LeftTurn = 2,
    RightTurn = 3,
}

/// One movement of the feet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub foot: Foot,
    pub direction: Direction,
    pub speed: u8,
    pub duration_ms: u32,
}

impl Segment {
    pub fn new(foot: Foot, direction: Direction, speed: u8, duration_ms: u32) -> Self {
        Self {
            foot,
            direction,
            speed,
            duration_ms,
        }
    }

    fn fields(&self) -> [u32; 4] {
        [
            self.foot as u32,
            self.direction as u32,
            u32::from(self.speed),
            self.duration_ms,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RobotCommand {
    /// Stop all motion.
    Stop,
    /// Arm angles in degrees. Extra values alternate pause (ms) and angle.
    Arm(Vec<u32>),
    /// Head angles in degrees, with the same layout as `Arm`.
    Head(Vec<u32>),
    /// Alternating on/off durations in milliseconds.
    Eyes(Vec<u32>),
    /// Movement segments, run in order.
    Feet(Vec<Segment>),
}

impl RobotCommand {
    pub fn arm(angle: u32) -> Self {
        RobotCommand::Arm(vec![angle])
    }

    pub fn head(angle: u32) -> Self {
        RobotCommand::Head(vec![angle])
    }

    /// Five laps of walking forward then turning around.
    pub fn walk_around() -> Self {
        let forward = Segment::new(Foot::Both, Direction::Forward, SPEED_SLOW, 2000);
        let turn = Segment::new(Foot::Both, Direction::RightTurn, SPEED_SLOW, 2000);
        RobotCommand::Feet([forward, turn].repeat(5))
    }
}

impl From<RobotCommand> for Frame {
    fn from(value: RobotCommand) -> Self {
        match value {
            RobotCommand::Stop => Frame::tag_only('S'),
            RobotCommand::Arm(angles) => Frame::new('A', angles),
            RobotCommand::Head(angles) => Frame::new('H', angles),
            RobotCommand::Eyes(pattern) => Frame::new('E', pattern),
            RobotCommand::Feet(segments) => {
                Frame::new('F', segments.iter().flat_map(Segment::fields))
            }
        }
    }
}
