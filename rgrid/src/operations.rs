//! Put, get and replicate of files and directory trees, plus the move family.
//!
//! Every transfer runs through the same steps:
//!
//! 1. validate the arguments and inspect the source (single file or tree)
//! 2. store the number of files in the control block and create the top-level target directory
//! 3. copy file by file, depth-first, checking pause, cancellation and the error threshold
//!    between files
//! 4. deliver one terminal status to the callback
//!
//! Failures in steps 1 and 2 are returned to the caller. A failure of one copy step is counted on
//! the control block and then either delivered to the callback as a [`TransferState::Failure`]
//! status (the transfer goes on) or, without a callback, returned to the caller.

use std::path::Path;
use std::sync::Arc;

use async_recursion::async_recursion;
use common::config::TransferConfig;
use common::control::TransferControlBlock;
use common::error::{Error, Result};
use common::localfs;
use common::status::{TransferState, TransferStatus, TransferStatusCallback, TransferType};
use common::summary::Summary;
use remote::path;
use remote::session::{ObjectKind, Session};

/// Callback, control block and labels shared by all steps of one logical transfer.
struct TransferContext<'a> {
    transfer_type: TransferType,
    callback: Option<&'a dyn TransferStatusCallback>,
    control: Option<Arc<TransferControlBlock>>,
    resource: String,
}

impl TransferContext<'_> {
    fn status(
        &self,
        state: TransferState,
        source: &str,
        target: &str,
        bytes: u64,
        total_bytes: u64,
        error: Option<Error>,
    ) -> TransferStatus {
        let (files_transferred_so_far, total_files) = match &self.control {
            Some(control) => (
                control.total_files_transferred_so_far(),
                control.total_files_to_transfer(),
            ),
            None => (0, 0),
        };
        TransferStatus {
            transfer_type: self.transfer_type,
            source_path: source.to_string(),
            target_path: target.to_string(),
            target_resource: self.resource.clone(),
            bytes_transferred_so_far: bytes,
            total_bytes,
            files_transferred_so_far,
            total_files,
            state,
            error: error.map(Arc::new),
        }
    }

    fn notify(&self, status: TransferStatus) -> Result<()> {
        match self.callback {
            Some(callback) => callback.status_callback(status),
            None => Ok(()),
        }
    }

    fn set_total_files(&self, total: usize) {
        if let Some(control) = &self.control {
            control.set_total_files_to_transfer(total);
        }
    }

    /// Applies the restart filter. A skipped file still counts as transferred.
    fn admits(&self, source: &str) -> bool {
        let Some(control) = &self.control else {
            return true;
        };
        if control.filter(source) {
            return true;
        }
        control.increment_files_transferred();
        tracing::debug!("skipping {source}, it precedes the restart point");
        false
    }

    fn succeeded(&self, source: &str, target: &str, bytes: u64) -> Result<Summary> {
        if let Some(control) = &self.control {
            control.increment_files_transferred();
        }
        let size = bytesize::ByteSize(bytes);
        tracing::info!("{} {source} -> {target}: {size}", self.transfer_type);
        self.notify(self.status(TransferState::Success, source, target, bytes, bytes, None))?;
        Ok(Summary::file(bytes))
    }

    /// Routes the failure of one copy step: counted on the control block, then delivered to the
    /// callback when there is one and returned otherwise.
    fn failed(&self, source: &str, target: &str, size: u64, error: Error) -> Result<Summary> {
        if let Some(control) = &self.control {
            control.report_error();
            control.enforce_error_threshold();
        }
        match self.callback {
            Some(callback) => {
                tracing::error!("{} {source} -> {target} failed: {error}", self.transfer_type);
                callback.status_callback(self.status(
                    TransferState::Failure,
                    source,
                    target,
                    0,
                    size,
                    Some(error),
                ))?;
                Ok(Summary::failed())
            }
            None => Err(error),
        }
    }

    fn finish(&self, source: &str, target: &str, summary: &Summary) -> Result<()> {
        let cancelled = self
            .control
            .as_ref()
            .is_some_and(|control| control.is_cancelled());
        let state = if cancelled {
            TransferState::Cancelled
        } else {
            TransferState::OverallCompletion
        };
        let bytes = summary.bytes_transferred;
        self.notify(self.status(state, source, target, bytes, bytes, None))
    }
}

/// Data transfer operations over one authenticated [`Session`].
#[derive(Debug)]
pub struct DataTransferOperations {
    session: Session,
    settings: TransferConfig,
}

impl DataTransferOperations {
    pub fn new(session: Session, settings: TransferConfig) -> Result<Self> {
        settings.validate().map_err(Error::InvalidArgument)?;
        Ok(Self { session, settings })
    }

    pub fn session(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn settings(&self) -> &TransferConfig {
        &self.settings
    }

    /// Disconnects the underlying session.
    pub async fn close(self) -> Result<()> {
        self.session.disconnect().await
    }

    fn context<'a>(
        &self,
        transfer_type: TransferType,
        resource: String,
        callback: Option<&'a dyn TransferStatusCallback>,
        control: Option<Arc<TransferControlBlock>>,
    ) -> Result<TransferContext<'a>> {
        let control = match (control, callback) {
            (Some(control), _) => Some(control),
            (None, Some(_)) => Some(Arc::new(TransferControlBlock::with_settings(
                None,
                self.settings.max_errors_before_cancel,
            )?)),
            (None, None) => None,
        };
        Ok(TransferContext {
            transfer_type,
            callback,
            control,
            resource,
        })
    }

    /// Waits out a pause, then runs the error threshold guard. Returns false once the transfer is
    /// cancelled.
    async fn proceed(&self, ctx: &TransferContext<'_>) -> bool {
        let Some(control) = &ctx.control else {
            return true;
        };
        control
            .wait_while_paused(self.settings.pause_poll_interval)
            .await;
        control.should_continue()
    }

    /// Uploads a local file or directory tree to `target`.
    ///
    /// A directory lands at `target/<directory name>`; a file lands at `target/<file name>` if
    /// `target` is a collection and at `target` otherwise.
    #[tracing::instrument(skip(self, callback, control))]
    pub async fn put(
        &mut self,
        local: &Path,
        target: &str,
        callback: Option<&dyn TransferStatusCallback>,
        control: Option<Arc<TransferControlBlock>>,
    ) -> Result<Summary> {
        if local.as_os_str().is_empty() {
            return Err(Error::invalid_argument("local source path is empty"));
        }
        let target = path::normalize(target)?;
        let resource = self.session.account().default_resource().to_string();
        let ctx = self.context(TransferType::Put, resource, callback, control)?;
        // restart points and root names are resolved against the absolute source path
        let local = &tokio::fs::canonicalize(local).await.map_err(|source| {
            Error::transfer_io(format!("cannot resolve local source {local:?}"), source)
        })?;
        let metadata = tokio::fs::metadata(local).await.map_err(|source| {
            Error::transfer_io(format!("cannot read local source {local:?}"), source)
        })?;
        let target_stat = self.session.stat(&target).await?;
        let source = local.display().to_string();
        let summary = if metadata.is_dir() {
            if target_stat
                .as_ref()
                .is_some_and(|stat| stat.kind == ObjectKind::DataObject)
            {
                return Err(Error::invalid_argument(format!(
                    "cannot put directory {local:?} into data object {target}"
                )));
            }
            ctx.set_total_files(localfs::count_files(local).await?);
            let root = path::join(&target, localfs::file_name(local)?);
            self.session.create_collection(&root).await?;
            Summary::directory() + self.put_directory(&ctx, local, &root).await?
        } else {
            ctx.set_total_files(1);
            let remote = match &target_stat {
                Some(stat) if stat.is_collection() => {
                    path::join(&target, localfs::file_name(local)?)
                }
                _ => target.clone(),
            };
            if self.proceed(&ctx).await {
                self.put_one(&ctx, local, metadata.len(), &remote).await?
            } else {
                Summary::default()
            }
        };
        ctx.finish(&source, &target, &summary)?;
        Ok(summary)
    }

    #[async_recursion]
    async fn put_directory<'a>(
        &mut self,
        ctx: &TransferContext<'a>,
        local: &Path,
        remote: &str,
    ) -> Result<Summary> {
        let mut summary = Summary::default();
        for entry in localfs::read_dir_sorted(local).await? {
            if !self.proceed(ctx).await {
                tracing::info!("put of {local:?} stopped");
                break;
            }
            let target = path::join(remote, localfs::file_name(&entry)?);
            let metadata = match tokio::fs::metadata(&entry).await {
                Ok(metadata) => metadata,
                Err(source) => {
                    let error = Error::transfer_io(format!("cannot read {entry:?}"), source);
                    summary += ctx.failed(&entry.display().to_string(), &target, 0, error)?;
                    continue;
                }
            };
            if metadata.is_dir() {
                self.session.create_collection(&target).await?;
                summary += Summary::directory();
                summary += self.put_directory(ctx, &entry, &target).await?;
            } else {
                summary += self.put_one(ctx, &entry, metadata.len(), &target).await?;
            }
        }
        Ok(summary)
    }

    async fn put_one(
        &mut self,
        ctx: &TransferContext<'_>,
        local: &Path,
        size: u64,
        remote: &str,
    ) -> Result<Summary> {
        let source = local.display().to_string();
        if !ctx.admits(&source) {
            return Ok(Summary::skipped());
        }
        match self
            .session
            .put_file(local, remote, &self.settings, ctx.control.clone())
            .await
        {
            Ok(bytes) => ctx.succeeded(&source, remote, bytes),
            Err(error) => ctx.failed(&source, remote, size, error),
        }
    }

    /// Downloads a data object or collection tree into `local`.
    ///
    /// A collection lands at `local/<collection name>`; a data object lands at
    /// `local/<object name>` if `local` is a directory and at `local` otherwise.
    #[tracing::instrument(skip(self, callback, control))]
    pub async fn get(
        &mut self,
        source: &str,
        local: &Path,
        callback: Option<&dyn TransferStatusCallback>,
        control: Option<Arc<TransferControlBlock>>,
    ) -> Result<Summary> {
        if local.as_os_str().is_empty() {
            return Err(Error::invalid_argument("local target path is empty"));
        }
        let source = path::normalize(source)?;
        let resource = self.session.account().default_resource().to_string();
        let ctx = self.context(TransferType::Get, resource, callback, control)?;
        let Some(stat) = self.session.stat(&source).await? else {
            return Err(Error::invalid_argument(format!("{source} does not exist")));
        };
        let local_is_dir = match tokio::fs::metadata(local).await {
            Ok(metadata) => Some(metadata.is_dir()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => {
                let context = format!("cannot read local target {local:?}");
                return Err(Error::transfer_io(context, error));
            }
        };
        let target = local.display().to_string();
        let summary = if stat.is_collection() {
            if local_is_dir == Some(false) {
                return Err(Error::invalid_argument(format!(
                    "cannot get collection {source} into file {local:?}"
                )));
            }
            ctx.set_total_files(self.session.count_files(&source).await?);
            let root = local.join(path::file_name(&source));
            create_local_dir(&root).await?;
            Summary::directory() + self.get_collection(&ctx, &source, &root).await?
        } else {
            ctx.set_total_files(1);
            let file = if local_is_dir == Some(true) {
                local.join(path::file_name(&source))
            } else {
                local.to_path_buf()
            };
            if self.proceed(&ctx).await {
                self.get_one(&ctx, &source, stat.size, &file).await?
            } else {
                Summary::default()
            }
        };
        ctx.finish(&source, &target, &summary)?;
        Ok(summary)
    }

    #[async_recursion]
    async fn get_collection<'a>(
        &mut self,
        ctx: &TransferContext<'a>,
        remote: &str,
        local: &Path,
    ) -> Result<Summary> {
        let mut summary = Summary::default();
        for entry in self.session.list_collection(remote).await? {
            if !self.proceed(ctx).await {
                tracing::info!("get of {remote} stopped");
                break;
            }
            let target = local.join(&entry.name);
            match entry.kind {
                ObjectKind::Collection => {
                    create_local_dir(&target).await?;
                    summary += Summary::directory();
                    summary += self.get_collection(ctx, &entry.path, &target).await?;
                }
                ObjectKind::DataObject => {
                    summary += self.get_one(ctx, &entry.path, entry.size, &target).await?;
                }
            }
        }
        Ok(summary)
    }

    async fn get_one(
        &mut self,
        ctx: &TransferContext<'_>,
        remote: &str,
        size: u64,
        local: &Path,
    ) -> Result<Summary> {
        let target = local.display().to_string();
        if !ctx.admits(remote) {
            return Ok(Summary::skipped());
        }
        match self
            .session
            .get_file(remote, local, size, &self.settings, ctx.control.clone())
            .await
        {
            Ok(bytes) => ctx.succeeded(remote, &target, bytes),
            Err(error) => ctx.failed(remote, &target, size, error),
        }
    }

    /// Replicates a data object, or every data object under a collection, to `resource`.
    #[tracing::instrument(skip(self, callback, control))]
    pub async fn replicate(
        &mut self,
        path: &str,
        resource: &str,
        callback: Option<&dyn TransferStatusCallback>,
        control: Option<Arc<TransferControlBlock>>,
    ) -> Result<Summary> {
        if resource.is_empty() {
            return Err(Error::invalid_argument("target resource is empty"));
        }
        let path = path::normalize(path)?;
        let ctx = self.context(TransferType::Replicate, resource.to_string(), callback, control)?;
        let Some(stat) = self.session.stat(&path).await? else {
            return Err(Error::invalid_argument(format!("{path} does not exist")));
        };
        let summary = if stat.is_collection() {
            ctx.set_total_files(self.session.count_files(&path).await?);
            self.replicate_collection(&ctx, &path, resource).await?
        } else {
            ctx.set_total_files(1);
            if self.proceed(&ctx).await {
                self.replicate_one(&ctx, &path, stat.size, resource).await?
            } else {
                Summary::default()
            }
        };
        ctx.finish(&path, resource, &summary)?;
        Ok(summary)
    }

    #[async_recursion]
    async fn replicate_collection<'a>(
        &mut self,
        ctx: &TransferContext<'a>,
        collection: &str,
        resource: &str,
    ) -> Result<Summary> {
        let mut summary = Summary::default();
        for entry in self.session.list_collection(collection).await? {
            if !self.proceed(ctx).await {
                tracing::info!("replication of {collection} stopped");
                break;
            }
            summary += match entry.kind {
                ObjectKind::Collection => {
                    self.replicate_collection(ctx, &entry.path, resource)
                        .await?
                }
                ObjectKind::DataObject => {
                    self.replicate_one(ctx, &entry.path, entry.size, resource)
                        .await?
                }
            };
        }
        Ok(summary)
    }

    async fn replicate_one(
        &mut self,
        ctx: &TransferContext<'_>,
        path: &str,
        size: u64,
        resource: &str,
    ) -> Result<Summary> {
        if !ctx.admits(path) {
            return Ok(Summary::skipped());
        }
        match self.session.replicate(path, resource).await {
            Ok(()) => ctx.succeeded(path, resource, size),
            Err(error) => ctx.failed(path, resource, size, error),
        }
    }

    /// Renames a data object or collection.
    ///
    /// Moving onto an existing collection places the source inside it. A move whose resolved
    /// target is the source itself does nothing.
    #[tracing::instrument(skip(self))]
    pub async fn move_object(&mut self, source: &str, target: &str) -> Result<()> {
        let source = path::normalize(source)?;
        let target = path::normalize(target)?;
        if source == target {
            tracing::debug!("{source} moved onto itself, nothing to do");
            return Ok(());
        }
        let Some(source_stat) = self.session.stat(&source).await? else {
            return Err(Error::invalid_argument(format!("{source} does not exist")));
        };
        let target_kind = self.session.stat(&target).await?.map(|stat| stat.kind);
        let resolved = match (source_stat.kind, target_kind) {
            (_, Some(ObjectKind::Collection)) => path::join(&target, path::file_name(&source)),
            (ObjectKind::Collection, Some(ObjectKind::DataObject)) => {
                return Err(Error::invalid_argument(format!(
                    "cannot move collection {source} onto data object {target}"
                )));
            }
            _ => target,
        };
        if resolved == source {
            tracing::debug!("{source} moved onto itself, nothing to do");
            return Ok(());
        }
        if source_stat.is_collection() && resolved.starts_with(&format!("{source}/")) {
            return Err(Error::invalid_argument(format!(
                "cannot move {source} into its own subtree"
            )));
        }
        self.session.rename(&source, &resolved, source_stat.kind).await
    }

    /// Moves the collection `source` to `target_collection/<name>`.
    #[tracing::instrument(skip(self))]
    pub async fn move_collection_under(
        &mut self,
        source: &str,
        target_collection: &str,
    ) -> Result<()> {
        let source = path::normalize(source)?;
        let target_collection = path::normalize(target_collection)?;
        let resolved = path::join(&target_collection, path::file_name(&source));
        if resolved == source {
            tracing::debug!("{source} is already under {target_collection}");
            return Ok(());
        }
        if target_collection == source || target_collection.starts_with(&format!("{source}/")) {
            return Err(Error::invalid_argument(format!(
                "cannot move {source} into its own subtree"
            )));
        }
        for collection in [&source, &target_collection] {
            match self.session.stat(collection).await? {
                Some(stat) if stat.is_collection() => {}
                Some(_) => {
                    return Err(Error::invalid_argument(format!(
                        "{collection} is not a collection"
                    )));
                }
                None => {
                    return Err(Error::invalid_argument(format!("{collection} does not exist")));
                }
            }
        }
        self.session
            .rename(&source, &resolved, ObjectKind::Collection)
            .await
    }

    /// Moves the replica of a data object to `resource`.
    #[tracing::instrument(skip(self))]
    pub async fn physical_move(&mut self, path: &str, resource: &str) -> Result<()> {
        if resource.is_empty() {
            return Err(Error::invalid_argument("target resource is empty"));
        }
        let path = path::normalize(path)?;
        match self.session.stat(&path).await? {
            Some(stat) if stat.kind == ObjectKind::DataObject => {
                self.session.physical_move(&path, resource).await
            }
            Some(_) => Err(Error::invalid_argument(format!(
                "{path} is a collection, only data objects can be moved between resources"
            ))),
            None => Err(Error::invalid_argument(format!("{path} does not exist"))),
        }
    }
}

async fn create_local_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| Error::transfer_io(format!("cannot create directory {path:?}"), source))
}
