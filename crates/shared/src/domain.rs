use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(DriverProfileId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

/// Which side of a conversation the signed-in user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Driver,
}

impl Role {
    /// Column holding this role's unread counter.
    pub fn unread_column(self) -> &'static str {
        match self {
            Role::Owner => "owner_unread_count",
            Role::Driver => "driver_unread_count",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Driver => "driver",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Ok(Role::Owner),
            "driver" => Ok(Role::Driver),
            other => Err(format!("unknown role '{other}', expected owner or driver")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Attachment,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Attachment => "attachment",
        }
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "attachment" => Ok(MessageType::Attachment),
            other => Err(format!("unknown message type '{other}'")),
        }
    }
}

/// The signed-in user as seen by the messaging core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub user_id: UserId,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_profile_id: Option<DriverProfileId>,
}

impl Viewer {
    pub fn owner(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::Owner,
            driver_profile_id: None,
        }
    }

    pub fn driver(user_id: UserId, driver_profile_id: Option<DriverProfileId>) -> Self {
        Self {
            user_id,
            role: Role::Driver,
            driver_profile_id,
        }
    }
}
