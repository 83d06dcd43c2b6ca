//! Update API, version 1.
//!
//! All paths are relative to the instance's base URL. Requests carry HTTP
//! basic credentials.
//!
//! | method | path                 | response                                 |
//! |--------|----------------------|------------------------------------------|
//! | GET    | `update/features`    | [`Features`] as JSON                     |
//! | PUT    | `uploadtemp/<name>`  | 200; replaces any earlier upload of name |
//! | POST   | `divert`             | 200, 404 unknown service, 412 not staged |
//! | PUT    | `update/root`        | 200, body is the hex SHA-256 written     |
//! | POST   | `update/switch`      | 200 once the active root is flipped      |
//! | POST   | `reboot`             | 200                                      |

use super::UpdateError;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Switching roots by partition UUID, the prerequisite for committing.
pub const FEATURE_PARTUUID: &str = "partuuid";
/// `update/root` answers with the hash of what it wrote.
pub const FEATURE_UPDATE_HASH: &str = "updatehash";

pub const FEATURES_PATH: &str = "update/features";
pub const DIVERT_PATH: &str = "divert";
pub const ROOT_PATH: &str = "update/root";
pub const SWITCH_PATH: &str = "update/switch";
pub const REBOOT_PATH: &str = "reboot";

/// Basic auth user name.
pub const USER: &str = "rootcast";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    pub protocol: u32,
    #[serde(default)]
    pub features: Vec<String>,
}

impl Features {
    pub fn supports(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn check_version(&self) -> Result<(), UpdateError> {
        if self.protocol != PROTOCOL_VERSION {
            return Err(UpdateError::Protocol(format!(
                "instance speaks update protocol {}, expected {}",
                self.protocol, PROTOCOL_VERSION
            )));
        }
        Ok(())
    }
}

/// Staging path of an upload.
///
/// Names are relative and may contain `/`, but never `..` components.
pub fn upload_path(name: &str) -> Result<String, UpdateError> {
    let valid = !name.is_empty()
        && !name.starts_with('/')
        && !name.contains('\\')
        && name.split('/').all(|c| !c.is_empty() && c != "." && c != "..");
    if !valid {
        return Err(UpdateError::Protocol(format!("invalid upload name {:?}", name)));
    }
    Ok(format!("uploadtemp/{}", name))
}
