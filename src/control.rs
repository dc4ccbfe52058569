//! Control messages: the request/response surface observers use to drive
//! the synchronizer.

use crate::metadata::UpdateInfo;
use crate::notify::{Notification, UpdateStatus};
use crate::orchestrator::{CacheSynchronizer, SyncOutcome};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::error;

/// Version string reported for `get-version`.
pub const ENGINE_VERSION: &str = concat!("mirrorsync-", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlRequest {
    GetVersion,
    CheckForUpdates,
    DoUpdate,
    GetUpdateInfo,
}

impl FromStr for ControlRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get-version" => Ok(ControlRequest::GetVersion),
            "check-for-updates" => Ok(ControlRequest::CheckForUpdates),
            "do-update" => Ok(ControlRequest::DoUpdate),
            "get-update-info" => Ok(ControlRequest::GetUpdateInfo),
            other => Err(format!("unknown control message: {}", other)),
        }
    }
}

fn update_info_message(info: UpdateInfo) -> Notification {
    Notification::UpdateInfo {
        status: if info.update_available {
            UpdateStatus::Available
        } else {
            UpdateStatus::UpToDate
        },
        date_checked: info.last_checked,
        update_size: info.update_size,
        new_version: info.upstream_version,
        current_version: info.current_version,
    }
}

/// Handles one control message.
///
/// Failures are turned into `status-info` responses; this never returns an error.
pub async fn handle_control(sync: &CacheSynchronizer, request: ControlRequest) -> Notification {
    match request {
        ControlRequest::GetVersion => Notification::VersionInfo {
            engine_version: ENGINE_VERSION.to_string(),
        },
        ControlRequest::CheckForUpdates => {
            sync.notifications()
                .notify(Notification::status("Checking..."));
            match sync.check_for_updates().await {
                Ok(info) => update_info_message(info),
                Err(e) => {
                    error!("Error in check_for_updates: {}", e);
                    Notification::status(format!(
                        "Sorry, couldn't check for updates. (Error: {})",
                        e
                    ))
                }
            }
        }
        ControlRequest::DoUpdate => match sync.synchronize().await {
            Ok(SyncOutcome::Installed(report)) => Notification::UpdateInfo {
                status: UpdateStatus::Installed,
                date_checked: None,
                update_size: Some(report.bytes_fetched),
                new_version: Some(report.version.clone()),
                current_version: Some(report.version),
            },
            Ok(outcome) => Notification::UpdateInfo {
                status: UpdateStatus::UpToDate,
                date_checked: None,
                update_size: None,
                new_version: Some(outcome.version().to_string()),
                current_version: Some(outcome.version().to_string()),
            },
            Err(e) => {
                error!("Error in synchronize: {}", e);
                // Every observer saw the progress messages, so every observer
                // hears about the failure.
                let message = Notification::status(format!("Sorry, update failed. (Error: {})", e));
                sync.notifications().notify(message.clone());
                message
            }
        },
        ControlRequest::GetUpdateInfo => match sync.metadata().update_info().await {
            Ok(info) => update_info_message(info),
            Err(e) => Notification::status(format!(
                "Sorry, couldn't read update info. (Error: {})",
                e
            )),
        },
    }
}
