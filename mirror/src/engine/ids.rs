use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

/// Accepts a non-negative integer given either as a JSON number or as a
/// numeric string. The companion app is not consistent about which one it sends.
struct LenientU64;

impl Visitor<'_> for LenientU64 {
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a non-negative integer or a numeric string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
        u64::try_from(v).map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
        v.trim()
            .parse()
            .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }
}

/// Deserialize a `u64` field that may arrive as a number or a numeric string.
pub(crate) fn lenient_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    d.deserialize_any(LenientU64)
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> u64 {
                id.0
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                lenient_u64(d).map(Self)
            }
        }
    };
}

id_type!(
    /// Connection id of an attached server, as assigned by the companion app.
    ServerId
);

id_type!(
    /// Channel id within one server. `0` is reserved for the synthetic root.
    ChannelId
);

id_type!(
    /// Client id within one server.
    ClientId
);

impl ChannelId {
    /// The synthetic root channel. Also the "first sibling" marker in `order`.
    pub const ROOT: ChannelId = ChannelId(0);

    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_from_number() {
        let id: ChannelId = serde_json::from_str("42").unwrap();
        assert_eq!(id, ChannelId(42));
    }

    #[test]
    fn test_id_from_numeric_string() {
        let id: ClientId = serde_json::from_str("\" 17\"").unwrap();
        assert_eq!(id, ClientId(17));
    }

    #[test]
    fn test_id_rejects_negative_and_garbage() {
        assert!(serde_json::from_str::<ServerId>("-1").is_err());
        assert!(serde_json::from_str::<ServerId>("\"abc\"").is_err());
        assert!(serde_json::from_str::<ServerId>("true").is_err());
    }

    #[test]
    fn test_root_channel() {
        assert!(ChannelId::ROOT.is_root());
        assert!(!ChannelId(1).is_root());
        assert_eq!(ChannelId::default(), ChannelId::ROOT);
    }

    #[test]
    fn test_id_serializes_as_plain_number() {
        assert_eq!(serde_json::to_string(&ServerId(3)).unwrap(), "3");
    }
}
