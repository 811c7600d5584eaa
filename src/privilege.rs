//! Privilege escalation configuration.
//!
//! Remote configuration commands (writing under `/etc`, restarting
//! services) run through an escalation helper on the target host. The
//! helper is `sudo` unless the profile selects `doas`.

use serde::{Deserialize, Serialize};

/// Privilege escalation method.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeMethod {
    /// Use `sudo` for privilege escalation.
    #[default]
    Sudo,
    /// Use `doas` for privilege escalation.
    Doas,
}

impl PrivilegeMethod {
    /// Returns the command name for this privilege method.
    pub fn command_name(&self) -> &'static str {
        match self {
            Self::Sudo => "sudo",
            Self::Doas => "doas",
        }
    }

    /// Prefixes a shell command line with this method.
    pub fn wrap(&self, command: &str) -> String {
        format!("{} {}", self.command_name(), command)
    }
}

impl std::fmt::Display for PrivilegeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.command_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_name() {
        assert_eq!(PrivilegeMethod::Sudo.command_name(), "sudo");
        assert_eq!(PrivilegeMethod::Doas.command_name(), "doas");
    }

    #[test]
    fn test_default_is_sudo() {
        assert_eq!(PrivilegeMethod::default(), PrivilegeMethod::Sudo);
    }

    #[test]
    fn test_wrap() {
        assert_eq!(PrivilegeMethod::Doas.wrap("mkdir -p /etc/docker"), "doas mkdir -p /etc/docker");
    }

    #[test]
    fn test_deserialize_lowercase() {
        let method: PrivilegeMethod = serde_yaml::from_str("doas").unwrap();
        assert_eq!(method, PrivilegeMethod::Doas);
    }
}
