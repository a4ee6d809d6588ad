use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ActorErr;

/// One of the named weight sets the actor keeps around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    /// The policy being trained.
    #[serde(rename = "actor")]
    Actor,
    /// The frozen reference policy used for the KL penalty.
    #[serde(rename = "ref")]
    Reference,
    /// The policy as of the last weight push, used as the behavior policy.
    #[serde(rename = "old_actor")]
    OldActor,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Actor, Role::Reference, Role::OldActor];

    /// The key used for this role in checkpoints, logs and per-token data.
    pub fn key(self) -> &'static str {
        match self {
            Role::Actor => "actor",
            Role::Reference => "ref",
            Role::OldActor => "old_actor",
        }
    }

    /// Prefix for the log-probabilities this role produces, the actor's and
    /// old actor's share the unprefixed slot.
    pub fn log_prob_prefix(self) -> &'static str {
        match self {
            Role::Reference => "ref_",
            Role::Actor | Role::OldActor => "",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Role {
    type Err = ActorErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.key() == s)
            .ok_or_else(|| ActorErr::InvalidConfig(format!("unknown role {s:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_checkpoint_keys() {
        for role in Role::ALL {
            assert_eq!(role.key().parse::<Role>().unwrap(), role);
        }
        assert!("critic".parse::<Role>().is_err());
    }

    #[test]
    fn serializes_as_key() {
        let json = serde_json::to_string(&Role::Reference).unwrap();
        assert_eq!(json, "\"ref\"");
    }
}
