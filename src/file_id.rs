//! Remote file identifiers, of the form `<group>/<remote_filename>`, and the
//! name parts a caller may choose for a new file.

use crate::proto::{EXT_NAME_MAX_LEN, GROUP_NAME_MAX_LEN, PREFIX_MAX_LEN};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Remote file id {0:?} is not of the form <group>/<filename>")]
    Malformed(String),

    #[error("Group name in remote file id {0:?} is longer than 16 bytes")]
    GroupTooLong(String),

    #[error("File extension {0:?} is longer than 6 bytes")]
    ExtTooLong(String),

    #[error("Slave prefix {0:?} is longer than 16 bytes")]
    PrefixTooLong(String),
}

/// Checks that `ext` fits the extension field of an upload request.
pub fn check_ext(ext: &str) -> Result<(), ParseError> {
    if ext.len() > EXT_NAME_MAX_LEN {
        return Err(ParseError::ExtTooLong(ext.to_string()));
    }
    Ok(())
}

/// Checks that `prefix` fits the prefix field of a slave upload request.
pub fn check_prefix(prefix: &str) -> Result<(), ParseError> {
    if prefix.len() > PREFIX_MAX_LEN {
        return Err(ParseError::PrefixTooLong(prefix.to_string()));
    }
    Ok(())
}

/// Names a file stored in a group.
///
/// The identifier is split on the first `/`: everything before it is the
/// group, everything after (which may contain more slashes) is the filename
/// within that group. Both must be non-empty.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteFileId {
    group_name: String,
    remote_filename: String,
}

impl RemoteFileId {
    pub fn parse(id: &str) -> Result<Self, ParseError> {
        let Some((group, filename)) = id.split_once('/') else {
            return Err(ParseError::Malformed(id.to_string()));
        };
        if group.is_empty() || filename.is_empty() {
            return Err(ParseError::Malformed(id.to_string()));
        }
        if group.len() > GROUP_NAME_MAX_LEN {
            return Err(ParseError::GroupTooLong(id.to_string()));
        }
        Ok(Self {
            group_name: group.to_string(),
            remote_filename: filename.to_string(),
        })
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn remote_filename(&self) -> &str {
        &self.remote_filename
    }
}

impl FromStr for RemoteFileId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for RemoteFileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group_name, self.remote_filename)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splits_on_first_slash() {
        let id = RemoteFileId::parse("group1/M00/00/00/abc.jpg").unwrap();
        assert_eq!(id.group_name(), "group1");
        assert_eq!(id.remote_filename(), "M00/00/00/abc.jpg");
        assert_eq!(id.to_string(), "group1/M00/00/00/abc.jpg");
    }

    #[test]
    fn rejects_malformed_ids() {
        for bad in ["noSlashHere", "", "/M00/abc.jpg", "group1/", "/"] {
            assert_eq!(
                RemoteFileId::parse(bad),
                Err(ParseError::Malformed(bad.to_string())),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_long_group_names() {
        let id = "a-group-name-over-sixteen/M00/abc";
        assert!(matches!(
            id.parse::<RemoteFileId>(),
            Err(ParseError::GroupTooLong(_))
        ));
    }

    #[test]
    fn name_parts_must_fit_their_fields() {
        assert_eq!(check_ext(""), Ok(()));
        assert_eq!(check_ext("tar.gz"), Ok(()));
        assert_eq!(
            check_ext("tar.bz2"),
            Err(ParseError::ExtTooLong("tar.bz2".to_string()))
        );

        assert_eq!(check_prefix("_sixteen_bytes__"), Ok(()));
        assert_eq!(
            check_prefix("_seventeen_bytes_"),
            Err(ParseError::PrefixTooLong("_seventeen_bytes_".to_string()))
        );
    }
}
