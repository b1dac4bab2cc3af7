use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// String-backed id newtype with `Display`, `Default` (a fresh id) and
/// conversions from owned and borrowed strings.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $fresh:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self($fresh.to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Primary key of a row in `jobs`. Fresh ids are UUIDv7, so they sort by
    /// creation time; ids supplied by callers are kept verbatim.
    JobId,
    Uuid::now_v7()
);

string_id!(
    /// One execution attempt of a job, shared by its events and its
    /// execution record.
    InstanceId,
    Uuid::new_v4()
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_job_ids_are_unique_uuids() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = JobId::from("job-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""job-1""#);
        let back: InstanceId = serde_json::from_str(r#""run-7""#).unwrap();
        assert_eq!(back, InstanceId::from("run-7"));
        assert_eq!(back.to_string(), "run-7");
    }
}
