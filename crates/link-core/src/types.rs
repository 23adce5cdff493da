//! Typed session payloads a core hands out in `SessionState`.

use std::fmt::{self, Display, Formatter};

use serde_json::{Value, json};

use crate::value::ToDocument;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub i32);

        impl $name {
            pub fn is_valid(&self) -> bool {
                self.0 > 0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i32> for $name {
            fn from(id: i32) -> Self {
                Self(id)
            }
        }

        impl ToDocument for $name {
            fn to_document(&self) -> Value {
                Value::from(self.0)
            }
        }
    };
}

id_type!(
    /// Identifies a network configured on the core.
    NetworkId
);
id_type!(
    /// Identifies an identity (nick set, real name) on the core.
    IdentityId
);
id_type!(
    /// Identifies a buffer (channel, query, status window).
    BufferId
);

/// Kind of buffer. Values match the bit flags used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Invalid = 0x00,
    Status = 0x01,
    Channel = 0x02,
    Query = 0x04,
    Group = 0x08,
}

/// Description of one buffer known to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub buffer_id: BufferId,
    pub network_id: NetworkId,
    pub kind: BufferKind,
    pub group_id: u32,
    pub name: String,
}

impl BufferInfo {
    pub fn new(
        buffer_id: BufferId,
        network_id: NetworkId,
        kind: BufferKind,
        name: impl Into<String>,
    ) -> Self {
        Self {
            buffer_id,
            network_id,
            kind,
            group_id: 0,
            name: name.into(),
        }
    }
}

impl ToDocument for BufferInfo {
    fn to_document(&self) -> Value {
        json!({
            "id": self.buffer_id.to_document(),
            "network": self.network_id.to_document(),
            "type": self.kind as i32,
            "group": self.group_id,
            "name": self.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::project_list;

    #[test]
    fn test_id_validity() {
        assert!(NetworkId(1).is_valid());
        assert!(!NetworkId(0).is_valid());
        assert!(!BufferId(-1).is_valid());
    }

    #[test]
    fn test_id_projects_to_integer() {
        assert_eq!(IdentityId(3).to_document(), json!(3));
        assert_eq!(project_list(&[NetworkId(1), NetworkId(4)]), vec![json!(1), json!(4)]);
    }

    #[test]
    fn test_buffer_info_document() {
        let info = BufferInfo::new(BufferId(12), NetworkId(2), BufferKind::Channel, "#rust");
        assert_eq!(
            info.to_document(),
            json!({"id": 12, "network": 2, "type": 2, "group": 0, "name": "#rust"})
        );
    }
}
