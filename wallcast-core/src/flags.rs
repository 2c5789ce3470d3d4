//! Block and group flags as carried in the ASCII headers.

use crate::error::WallError;

/// Interpretation of a block or block group on the receive side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum BlockFlag {
    /// Raw or compressed pixel payload.
    PixelData = 1,
    /// The stream partition changed; the group carries the new config id.
    ConfigUpdate = 2,
    /// Marks the end of a frame.
    EndFrame = 3,
    /// Generic control unit without payload.
    Control = 4,
}

impl BlockFlag {
    /// Wire value.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Whether the unit carries pixel data.
    pub const fn is_pixel(self) -> bool {
        matches!(self, BlockFlag::PixelData)
    }
}

impl TryFrom<i32> for BlockFlag {
    type Error = WallError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(BlockFlag::PixelData),
            2 => Ok(BlockFlag::ConfigUpdate),
            3 => Ok(BlockFlag::EndFrame),
            4 => Ok(BlockFlag::Control),
            other => Err(WallError::UnknownVariant {
                type_name: "BlockFlag",
                value: other as i64,
            }),
        }
    }
}

/// Which receivers get the trailing control block of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendCondition {
    /// Every connected receiver.
    #[default]
    All,
    /// Receivers that got at least one pixel block this frame.
    Active,
    /// Receivers that got no pixel block this frame.
    Inactive,
}

impl SendCondition {
    /// Whether a receiver with the given activity state qualifies.
    pub fn includes(self, active: bool) -> bool {
        match self {
            SendCondition::All => true,
            SendCondition::Active => active,
            SendCondition::Inactive => !active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_codes_roundtrip() {
        for flag in [
            BlockFlag::PixelData,
            BlockFlag::ConfigUpdate,
            BlockFlag::EndFrame,
            BlockFlag::Control,
        ] {
            assert_eq!(BlockFlag::try_from(flag.code()).unwrap(), flag);
        }
    }

    #[test]
    fn unknown_flag_rejected() {
        assert!(matches!(
            BlockFlag::try_from(9),
            Err(WallError::UnknownVariant { value: 9, .. })
        ));
    }

    #[test]
    fn send_condition_filters() {
        assert!(SendCondition::All.includes(false));
        assert!(SendCondition::Active.includes(true));
        assert!(!SendCondition::Active.includes(false));
        assert!(SendCondition::Inactive.includes(false));
    }
}
