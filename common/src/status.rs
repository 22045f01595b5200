//! Transfer status snapshots and the callback interface that receives them.

use std::sync::Arc;

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    Put,
    Get,
    Replicate,
}

impl std::fmt::Display for TransferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferType::Put => "put",
            TransferType::Get => "get",
            TransferType::Replicate => "replicate",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// One file completed.
    Success,
    /// One file (or the whole single-file transfer) failed.
    Failure,
    /// Terminal state of a transfer stopped through its control block.
    Cancelled,
    /// Terminal state of a transfer that ran to the end.
    OverallCompletion,
}

/// Immutable snapshot delivered to a [`TransferStatusCallback`].
#[derive(Clone, Debug, serde::Serialize)]
pub struct TransferStatus {
    pub transfer_type: TransferType,
    pub source_path: String,
    pub target_path: String,
    pub target_resource: String,
    pub bytes_transferred_so_far: u64,
    pub total_bytes: u64,
    pub files_transferred_so_far: usize,
    pub total_files: usize,
    pub state: TransferState,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<Arc<Error>>,
}

fn serialize_error<S>(error: &Option<Arc<Error>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match error {
        Some(error) => {
            let mut text = error.to_string();
            let mut source = std::error::Error::source(error.as_ref());
            while let Some(cause) = source {
                text.push_str(": ");
                text.push_str(&cause.to_string());
                source = cause.source();
            }
            serializer.serialize_some(&text)
        }
        None => serializer.serialize_none(),
    }
}

impl TransferStatus {
    pub fn is_failure(&self) -> bool {
        self.state == TransferState::Failure
    }

    /// Completed fraction of the file count, if the total is known.
    pub fn files_fraction(&self) -> Option<f64> {
        if self.total_files == 0 {
            return None;
        }
        Some(self.files_transferred_so_far as f64 / self.total_files as f64)
    }
}

/// Receives status snapshots while a transfer runs.
///
/// Registering a callback changes how per-file failures are handled: they are delivered here as
/// [`TransferState::Failure`] snapshots instead of being returned to the caller. An error returned
/// by the callback itself aborts the transfer.
pub trait TransferStatusCallback: Send + Sync {
    fn status_callback(&self, status: TransferStatus) -> Result<(), Error>;
}

impl<F> TransferStatusCallback for F
where
    F: Fn(TransferStatus) -> Result<(), Error> + Send + Sync,
{
    fn status_callback(&self, status: TransferStatus) -> Result<(), Error> {
        self(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: TransferState, error: Option<Error>) -> TransferStatus {
        TransferStatus {
            transfer_type: TransferType::Put,
            source_path: "/tmp/a.txt".into(),
            target_path: "/zone/home/rods/a.txt".into(),
            target_resource: "demoResc".into(),
            bytes_transferred_so_far: 3,
            total_bytes: 3,
            files_transferred_so_far: 1,
            total_files: 4,
            state,
            error: error.map(Arc::new),
        }
    }

    #[test]
    fn closures_are_callbacks() {
        let seen = std::sync::Mutex::new(Vec::new());
        let callback = |status: TransferStatus| {
            seen.lock().unwrap().push(status.state);
            Ok(())
        };
        callback
            .status_callback(status(TransferState::Success, None))
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![TransferState::Success]);
    }

    #[test]
    fn serializes_error_as_text() -> anyhow::Result<()> {
        let failed = status(
            TransferState::Failure,
            Some(Error::transfer("short read from local file")),
        );
        assert!(failed.is_failure());
        assert_eq!(failed.files_fraction(), Some(0.25));
        let json: serde_json::Value = serde_json::to_value(&failed)?;
        assert_eq!(json["state"], "failure");
        assert_eq!(json["transfer_type"], "put");
        assert_eq!(
            json["error"],
            "transfer error: short read from local file"
        );
        Ok(())
    }
}
