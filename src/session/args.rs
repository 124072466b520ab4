use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::{Display, EnumString};

/// How additional debuggee processes (forks, threads) are presented to a client.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChildSessions {
    /// Each additional process gets its own debug session, requested from a client with
    /// `startDebugging` and connected through a relay.
    #[default]
    Relay,
    /// Each additional process is a thread of the current session.
    Threads,
}

/// Arguments of `launch` and `attach` requests.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LaunchArguments {
    /// Script to debug, as seen by a client.
    pub program: Option<String>,
    /// Script arguments.
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Interpreter, adapter configuration is used if not set.
    pub perl: Option<String>,
    /// Interpreter arguments placed before the script.
    pub perl_args: Vec<String>,
    /// Run with `-dt` instead of `-d`.
    pub threads: bool,
    /// Run the debuggee on this host via ssh.
    pub hostname: Option<String>,
    /// Address of this host as seen from the remote one.
    pub local_hostname: Option<String>,
    /// Attach port, or relay port for a nested session.
    pub port: Option<u16>,
    pub stop_on_entry: bool,
    pub child_sessions: Option<ChildSessions>,
    /// Session is a nested one, started for a relayed process.
    #[serde(rename = "__proxy")]
    pub proxy: bool,
}

impl Default for LaunchArguments {
    fn default() -> Self {
        Self {
            program: None,
            args: vec![],
            cwd: None,
            env: BTreeMap::new(),
            perl: None,
            perl_args: vec![],
            threads: false,
            hostname: None,
            local_hostname: None,
            port: None,
            stop_on_entry: true,
            child_sessions: None,
            proxy: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_launch_arguments() {
        let args: LaunchArguments = serde_json::from_value(json!({
            "type": "perl",
            "request": "launch",
            "program": "/work/t.pl",
            "args": ["--verbose"],
            "env": {"PERL5LIB": "lib"},
            "perlArgs": ["-Ilib"],
            "localHostname": "10.0.0.2",
            "childSessions": "threads",
        }))
        .unwrap();

        assert_eq!(args.program.as_deref(), Some("/work/t.pl"));
        assert_eq!(args.args, vec!["--verbose"]);
        assert_eq!(args.env.get("PERL5LIB").map(String::as_str), Some("lib"));
        assert_eq!(args.perl_args, vec!["-Ilib"]);
        assert_eq!(args.local_hostname.as_deref(), Some("10.0.0.2"));
        assert_eq!(args.child_sessions, Some(ChildSessions::Threads));
        assert!(args.stop_on_entry);
        assert!(!args.proxy);
    }

    #[test]
    fn test_nested_session_arguments() {
        let args: LaunchArguments = serde_json::from_value(json!({
            "request": "attach",
            "port": 41234,
            "stopOnEntry": false,
            "__proxy": true,
        }))
        .unwrap();

        assert_eq!(args.port, Some(41234));
        assert!(!args.stop_on_entry);
        assert!(args.proxy);
    }

    #[test]
    fn test_child_sessions_from_str() {
        assert_eq!(ChildSessions::from_str("relay").unwrap(), ChildSessions::Relay);
        assert_eq!(ChildSessions::from_str("threads").unwrap(), ChildSessions::Threads);
        assert!(ChildSessions::from_str("forks").is_err());
        assert_eq!(ChildSessions::Threads.to_string(), "threads");
    }
}
