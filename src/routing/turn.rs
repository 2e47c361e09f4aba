// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::fmt;

use super::lanes;

/// Minimal bearing difference (in degrees) classified as a turn.
pub const TURN_DEGREE_MIN: f64 = 45.0;

/// Bearing difference (in degrees) above which a turn is sharp.
pub const TURN_DEGREE_SHARP: f64 = 120.0;

/// Bearing difference (in degrees) above which a turn becomes a U-turn,
/// for turns against the driving side.
pub const TURN_DEGREE_U_TURN: f64 = 150.0;

/// Kind of maneuver at the beginning of a route segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TurnKind {
    /// Continue (go straight)
    C = 1,
    TL = 2,
    TSLL = 3,
    TSHL = 4,
    TR = 5,
    TSLR = 6,
    TSHR = 7,
    KL = 8,
    KR = 9,
    TU = 10,
    /// Right U-turn
    TRU = 11,
    /// Off route
    OFFR = 12,
    /// Roundabout
    RNDB = 13,
    /// Roundabout, left-side driving
    RNLB = 14,
}

impl TurnKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use TurnKind::*;
        Some(match raw {
            1 => C,
            2 => TL,
            3 => TSLL,
            4 => TSHL,
            5 => TR,
            6 => TSLR,
            7 => TSHR,
            8 => KL,
            9 => KR,
            10 => TU,
            11 => TRU,
            12 => OFFR,
            13 => RNDB,
            14 => RNLB,
            _ => return None,
        })
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self as u32
    }

    /// Converts a single `turn:lanes` value into a turn kind.
    pub fn from_lane_tag(lane: &str) -> Self {
        match lane {
            "none" | "through" => Self::C,
            "slight_right" | "merge_to_right" => Self::TSLR,
            "slight_left" | "merge_to_left" => Self::TSLL,
            "right" => Self::TR,
            "left" => Self::TL,
            "sharp_right" => Self::TSHR,
            "sharp_left" => Self::TSHL,
            "reverse" => Self::TU,
            _ => Self::C,
        }
    }

    pub fn is_left_turn(self) -> bool {
        matches!(self, Self::TL | Self::TSHL | Self::TSLL | Self::TU | Self::KL)
    }

    pub fn is_left_turn_no_u_turn(self) -> bool {
        matches!(self, Self::TL | Self::TSHL | Self::TSLL | Self::KL)
    }

    pub fn is_right_turn(self) -> bool {
        matches!(self, Self::TR | Self::TSHR | Self::TSLR | Self::TRU | Self::KR)
    }

    pub fn is_right_turn_no_u_turn(self) -> bool {
        matches!(self, Self::TR | Self::TSHR | Self::TSLR | Self::KR)
    }

    pub fn is_slight_turn(self) -> bool {
        matches!(self, Self::TSLL | Self::TSLR | Self::C | Self::KL | Self::KR)
    }

    /// Position of the turn on a left (negative) to right (positive) scale.
    pub fn order_from_left_to_right(self) -> i32 {
        match self {
            Self::TU => -5,
            Self::TSHL => -4,
            Self::TL => -3,
            Self::TSLL => -2,
            Self::KL => -1,
            Self::TRU => 5,
            Self::TSHR => 4,
            Self::TR => 3,
            Self::TSLR => 2,
            Self::KR => 1,
            _ => 0,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::C => "C",
            Self::TL => "TL",
            Self::TSLL => "TSLL",
            Self::TSHL => "TSHL",
            Self::TR => "TR",
            Self::TSLR => "TSLR",
            Self::TSHR => "TSHR",
            Self::KL => "KL",
            Self::KR => "KR",
            Self::TU => "TU",
            Self::TRU => "TRU",
            Self::OFFR => "OFFR",
            Self::RNDB => "RNDB",
            Self::RNLB => "RNLB",
        }
    }
}

/// Classifies a bearing change (in degrees, positive to the left) into a turn.
/// Returns `None` for changes below [TURN_DEGREE_MIN], which need
/// keep-left/right analysis instead.
pub fn classify_turn(mpi: f64, left_side: bool) -> Option<TurnKind> {
    if mpi >= TURN_DEGREE_MIN {
        Some(if mpi < TURN_DEGREE_SHARP {
            TurnKind::TL
        } else if mpi < TURN_DEGREE_U_TURN || left_side {
            TurnKind::TSHL
        } else {
            TurnKind::TU
        })
    } else if mpi < -TURN_DEGREE_MIN {
        Some(if mpi > -TURN_DEGREE_SHARP {
            TurnKind::TR
        } else if mpi > -TURN_DEGREE_U_TURN || !left_side {
            TurnKind::TSHR
        } else {
            TurnKind::TRU
        })
    } else {
        None
    }
}

/// Maneuver at the beginning of a route segment, with lane guidance.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnType {
    pub value: TurnKind,

    /// Exit number, for roundabouts.
    pub exit_out: u32,

    /// Clockwise head rotation (in degrees), with the previous direction pointing north.
    pub turn_angle: f64,

    pub skip_to_speak: bool,

    /// Lanes encoded by [lanes] bitfields.
    pub lanes: Vec<u32>,

    pub possibly_left_turn: bool,
    pub possibly_right_turn: bool,
}

impl TurnType {
    pub fn value_of(kind: TurnKind, left_side: bool) -> Self {
        let value = match kind {
            TurnKind::TU if left_side => TurnKind::TRU,
            TurnKind::RNDB if left_side => TurnKind::RNLB,
            k => k,
        };
        Self {
            value,
            exit_out: 0,
            turn_angle: 0.0,
            skip_to_speak: false,
            lanes: Vec::new(),
            possibly_left_turn: false,
            possibly_right_turn: false,
        }
    }

    pub fn straight() -> Self {
        Self::value_of(TurnKind::C, false)
    }

    pub fn exit_turn(out: u32, angle: f64, left_side: bool) -> Self {
        let mut t = Self::value_of(TurnKind::RNDB, left_side);
        t.exit_out = out;
        t.turn_angle = angle;
        t
    }

    /// Parses a turn code, as produced by [TurnType::to_xml_string].
    pub fn from_code(s: &str, left_side: bool) -> Self {
        for prefix in ["EXIT", "RNDB", "RNLB"] {
            if let Some(rest) = s.strip_prefix(prefix) {
                return Self::exit_turn(rest.parse().unwrap_or(0), 0.0, left_side);
            }
        }
        let kind = (1..=12)
            .filter_map(TurnKind::from_raw)
            .find(|k| k.code() == s)
            .unwrap_or(TurnKind::C);
        Self::value_of(kind, left_side)
    }

    #[inline]
    pub fn is_round_about(&self) -> bool {
        matches!(self.value, TurnKind::RNDB | TurnKind::RNLB)
    }

    #[inline]
    pub fn is_left_side(&self) -> bool {
        matches!(self.value, TurnKind::RNLB | TurnKind::TRU)
    }

    #[inline]
    pub fn keep_left(&self) -> bool {
        self.value == TurnKind::KL
    }

    #[inline]
    pub fn keep_right(&self) -> bool {
        self.value == TurnKind::KR
    }

    #[inline]
    pub fn go_ahead(&self) -> bool {
        self.value == TurnKind::C
    }

    /// Primary turn of the first active lane, or straight.
    pub fn active_common_lane_turn(&self) -> Option<TurnKind> {
        if self.lanes.is_empty() {
            return Some(TurnKind::C);
        }
        match self.lanes.iter().find(|&&l| lanes::is_active(l)) {
            Some(&l) => lanes::primary(l),
            None => Some(TurnKind::C),
        }
    }

    pub fn to_xml_string(&self) -> String {
        if self.is_round_about() {
            format!("{}{}", self.value.code(), self.exit_out)
        } else {
            self.value.code().to_string()
        }
    }
}

impl fmt::Display for TurnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            TurnKind::RNDB | TurnKind::RNLB => write!(f, "Take {} exit", self.exit_out)?,
            TurnKind::C => f.write_str("Go ahead")?,
            TurnKind::TSLL => f.write_str("Turn slightly left")?,
            TurnKind::TL => f.write_str("Turn left")?,
            TurnKind::TSHL => f.write_str("Turn sharply left")?,
            TurnKind::TSLR => f.write_str("Turn slightly right")?,
            TurnKind::TR => f.write_str("Turn right")?,
            TurnKind::TSHR => f.write_str("Turn sharply right")?,
            TurnKind::TU | TurnKind::TRU => f.write_str("Make uturn")?,
            TurnKind::KL => f.write_str("Keep left")?,
            TurnKind::KR => f.write_str("Keep right")?,
            TurnKind::OFFR => f.write_str("Off route")?,
        }
        if !self.lanes.is_empty() {
            write!(f, "({})", lanes::to_string(&self.lanes))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_boundaries() {
        assert_eq!(classify_turn(44.9, false), None);
        assert_eq!(classify_turn(45.0, false), Some(TurnKind::TL));
        assert_eq!(classify_turn(119.9, false), Some(TurnKind::TL));
        assert_eq!(classify_turn(120.0, false), Some(TurnKind::TSHL));
        assert_eq!(classify_turn(149.9, false), Some(TurnKind::TSHL));
        assert_eq!(classify_turn(150.0, false), Some(TurnKind::TU));
        assert_eq!(classify_turn(150.0, true), Some(TurnKind::TSHL));

        assert_eq!(classify_turn(-45.0, false), None);
        assert_eq!(classify_turn(-45.1, false), Some(TurnKind::TR));
        assert_eq!(classify_turn(-120.0, false), Some(TurnKind::TSHR));
        assert_eq!(classify_turn(-150.0, false), Some(TurnKind::TSHR));
        assert_eq!(classify_turn(-170.0, false), Some(TurnKind::TSHR));
        assert_eq!(classify_turn(-150.0, true), Some(TurnKind::TRU));
    }

    #[test]
    fn left_side_variants() {
        assert_eq!(TurnType::value_of(TurnKind::TU, true).value, TurnKind::TRU);
        assert_eq!(TurnType::value_of(TurnKind::RNDB, true).value, TurnKind::RNLB);
        assert_eq!(TurnType::value_of(TurnKind::TL, true).value, TurnKind::TL);
    }

    #[test]
    fn codes_and_descriptions() {
        let t = TurnType::exit_turn(3, 90.0, false);
        assert_eq!(t.to_xml_string(), "RNDB3");
        assert_eq!(t.to_string(), "Take 3 exit");
        assert_eq!(TurnType::from_code("RNDB3", false).exit_out, 3);
        assert_eq!(TurnType::from_code("TSHR", false).value, TurnKind::TSHR);
        assert_eq!(TurnType::from_code("???", false).value, TurnKind::C);

        let mut t = TurnType::value_of(TurnKind::TL, false);
        t.lanes = vec![(TurnKind::TL.raw() << 1) | 1, TurnKind::C.raw() << 1];
        assert_eq!(t.to_string(), "Turn left(+TL|C)");
        assert_eq!(t.active_common_lane_turn(), Some(TurnKind::TL));
    }

    #[test]
    fn lane_tags() {
        assert_eq!(TurnKind::from_lane_tag("merge_to_left"), TurnKind::TSLL);
        assert_eq!(TurnKind::from_lane_tag("reverse"), TurnKind::TU);
        assert_eq!(TurnKind::from_lane_tag("whatever"), TurnKind::C);
    }
}
