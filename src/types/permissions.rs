use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Permissions: u64 {
        const CONNECT         = 1 << 0;
        const SPEAK           = 1 << 1;
        const SEND_MESSAGES   = 1 << 2;
        const CREATE_CHANNEL  = 1 << 3;
        const MANAGE_CHANNELS = 1 << 4;
        const MANAGE_ROLES    = 1 << 5;
        const KICK_USER       = 1 << 6;
        const BAN_USER        = 1 << 7;
        const ADMIN           = 1 << 8;
    }
}

impl Permissions {
    /// ADMIN passes every check regardless of the other bits.
    pub fn has(self, flag: Permissions) -> bool {
        self.contains(Permissions::ADMIN) || self.contains(flag)
    }

    /// Wire form: decimal string, so 64-bit masks survive JSON number parsing.
    pub fn as_decimal(self) -> String {
        self.bits().to_string()
    }
}

impl Default for Permissions {
    fn default() -> Self {
        // Baseline grants for a freshly seeded member role
        Self::CONNECT | Self::SPEAK | Self::SEND_MESSAGES | Self::CREATE_CHANNEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_with_plain_mask() {
        let mask = Permissions::CONNECT | Permissions::SPEAK;
        assert_eq!(mask.bits(), 3);
        assert!(mask.has(Permissions::SPEAK));
        assert!(!mask.has(Permissions::MANAGE_ROLES));
    }

    #[test]
    fn test_admin_short_circuits_every_flag() {
        let mask = Permissions::ADMIN;
        assert_eq!(mask.bits(), 256);
        for flag in Permissions::all().iter() {
            assert!(mask.has(flag));
        }
        assert!(mask.has(Permissions::KICK_USER));
    }

    #[test]
    fn test_decimal_wire_form() {
        let mask = Permissions::ADMIN | Permissions::CONNECT;
        assert_eq!(mask.as_decimal(), "257");
    }
}
