//! Authenticated session with catalog and data object operations.

use std::sync::Arc;

use async_recursion::async_recursion;
use common::config::{ConnectionConfig, TransferConfig};
use common::control::TransferControlBlock;
use common::error::{Error, Result};

use crate::account::Account;
use crate::auth::{self, AuthResult};
use crate::connection::Connection;
use crate::parallel::{self, Direction, ParallelTransferStrategy};
use crate::path;
use crate::protocol::api::{self, ApiNumber, base_code};
use crate::protocol::messages::{
    CollInp, DataObjCopyInp, DataObjInp, GenQueryInp, GenQueryOut, PortalOprOut, RodsObjStat,
    int_pi,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    DataObject,
    Collection,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectStat {
    pub path: String,
    pub kind: ObjectKind,
    pub size: u64,
}

impl ObjectStat {
    pub fn is_collection(&self) -> bool {
        self.kind == ObjectKind::Collection
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionEntry {
    pub path: String,
    pub name: String,
    pub kind: ObjectKind,
    pub size: u64,
}

#[derive(Debug)]
pub struct Session {
    connection: Connection,
    account: Account,
    auth: AuthResult,
}

fn is_code(error: &Error, codes: &[i32]) -> bool {
    error
        .server_code()
        .is_some_and(|code| codes.contains(&base_code(code)))
}

fn local_io(context: String) -> impl FnOnce(std::io::Error) -> Error {
    move |source| Error::transfer_io(context, source)
}

impl Session {
    /// Connects to the account's server and authenticates.
    #[tracing::instrument(skip(config))]
    pub async fn open(account: Account, config: &ConnectionConfig) -> Result<Self> {
        config.validate().map_err(Error::InvalidArgument)?;
        let mut connection = Connection::connect(account.host(), account.port(), config).await?;
        let auth = auth::authenticate(&mut connection, &account).await?;
        Ok(Self {
            connection,
            account,
            auth,
        })
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn auth_result(&self) -> &AuthResult {
        &self.auth
    }

    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Type and size of `path`, `None` if it does not exist.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn stat(&mut self, path: &str) -> Result<Option<ObjectStat>> {
        let input = DataObjInp::new(path, 0);
        let reply = match self
            .connection
            .api_request(ApiNumber::ObjStat, Some(&input.to_tag()))
            .await
        {
            Ok(reply) => reply,
            Err(error)
                if is_code(&error, &[api::USER_FILE_DOES_NOT_EXIST, api::CAT_NO_ROWS_FOUND]) =>
            {
                return Ok(None);
            }
            Err(error) => return Err(error),
        };
        let stat = RodsObjStat::from_tag(reply.body()?)?;
        let kind = match stat.obj_type {
            api::DATA_OBJ_T => ObjectKind::DataObject,
            api::COLL_OBJ_T => ObjectKind::Collection,
            other => {
                return Err(Error::protocol(format!(
                    "unexpected object type {other} for {path}"
                )));
            }
        };
        Ok(Some(ObjectStat {
            path: path.to_string(),
            kind,
            size: u64::try_from(stat.size).unwrap_or(0),
        }))
    }

    /// Creates `path` and any missing parents. An existing collection is not an error.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn create_collection(&mut self, path: &str) -> Result<()> {
        let mut input = CollInp {
            name: path.to_string(),
            ..Default::default()
        };
        input.options.insert(api::RECURSIVE_OPR_KW, "");
        match self
            .connection
            .api_request(ApiNumber::CollCreate, Some(&input.to_tag()))
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if is_code(&error, &[api::CAT_ALREADY_HAS_ITEM_BY_THAT_NAME]) => {
                tracing::debug!("collection {path} already exists");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn query(
        &mut self,
        select: Vec<i32>,
        conditions: Vec<(i32, String)>,
    ) -> Result<Vec<Vec<String>>> {
        let mut input = GenQueryInp {
            max_rows: api::MAX_SQL_ROWS,
            continue_inx: 0,
            select,
            conditions,
        };
        let mut rows = Vec::new();
        loop {
            let reply = match self
                .connection
                .api_request(ApiNumber::GenQuery, Some(&input.to_tag()))
                .await
            {
                Ok(reply) => reply,
                Err(error) if is_code(&error, &[api::CAT_NO_ROWS_FOUND]) => break,
                Err(error) => return Err(error),
            };
            let out = GenQueryOut::from_tag(reply.body()?)?;
            for row in 0..out.row_count {
                let values = input
                    .select
                    .iter()
                    .map(|column| {
                        out.column(*column)
                            .and_then(|values| values.get(row))
                            .cloned()
                            .ok_or_else(|| {
                                Error::protocol(format!("query reply lacks column {column}"))
                            })
                    })
                    .collect::<Result<Vec<_>>>()?;
                rows.push(values);
            }
            if out.continue_inx <= 0 {
                break;
            }
            input.continue_inx = out.continue_inx;
        }
        Ok(rows)
    }

    /// Direct children of a collection: sub-collections first, then data objects, each sorted by
    /// name.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn list_collection(&mut self, path: &str) -> Result<Vec<CollectionEntry>> {
        if path.contains('\'') {
            return Err(Error::invalid_argument(format!(
                "cannot list {path:?}: quotes are not supported in listed paths"
            )));
        }
        let condition = format!("= '{path}'");
        let mut collections: Vec<CollectionEntry> = self
            .query(
                vec![api::COL_COLL_NAME],
                vec![(api::COL_COLL_PARENT_NAME, condition.clone())],
            )
            .await?
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            // the root collection is listed as its own child
            .filter(|child| child != path)
            .map(|child| CollectionEntry {
                name: path::file_name(&child).to_string(),
                path: child,
                kind: ObjectKind::Collection,
                size: 0,
            })
            .collect();
        collections.sort_by(|a, b| a.name.cmp(&b.name));
        let mut objects = Vec::new();
        for row in self
            .query(
                vec![api::COL_DATA_NAME, api::COL_DATA_SIZE],
                vec![(api::COL_COLL_NAME, condition)],
            )
            .await?
        {
            let [name, size] = <[String; 2]>::try_from(row)
                .map_err(|_| Error::protocol("data object row with wrong column count"))?;
            let size = size
                .trim()
                .parse()
                .map_err(|_| Error::protocol(format!("invalid data size {size:?} for {name}")))?;
            objects.push(CollectionEntry {
                path: path::join(path, &name),
                name,
                kind: ObjectKind::DataObject,
                size,
            });
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        collections.extend(objects);
        Ok(collections)
    }

    /// Number of data objects under `path`, recursively.
    #[async_recursion]
    pub async fn count_files(&mut self, path: &str) -> Result<usize> {
        let mut count = 0;
        for entry in self.list_collection(path).await? {
            count += match entry.kind {
                ObjectKind::DataObject => 1,
                ObjectKind::Collection => self.count_files(&entry.path).await?,
            };
        }
        Ok(count)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn rename(&mut self, source: &str, target: &str, kind: ObjectKind) -> Result<()> {
        let opr_type = match kind {
            ObjectKind::DataObject => api::RENAME_DATA_OBJ,
            ObjectKind::Collection => api::RENAME_COLL,
        };
        let input = DataObjCopyInp::rename(source, target, opr_type);
        self.connection
            .api_request(ApiNumber::DataObjRename, Some(&input.to_tag()))
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn replicate(&mut self, path: &str, resource: &str) -> Result<()> {
        let mut input = DataObjInp::new(path, api::REPLICATE_OPR);
        input.options.insert(api::DEST_RESC_NAME_KW, resource);
        self.connection
            .api_request(ApiNumber::DataObjRepl, Some(&input.to_tag()))
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn physical_move(&mut self, path: &str, resource: &str) -> Result<()> {
        let mut input = DataObjInp::new(path, api::PHYMV_OPR);
        input.options.insert(api::DEST_RESC_NAME_KW, resource);
        self.connection
            .api_request(ApiNumber::DataObjPhymv, Some(&input.to_tag()))
            .await?;
        Ok(())
    }

    /// Uploads one local file to the data object `remote`. Returns the bytes sent.
    #[tracing::instrument(level = "debug", skip(self, settings, control))]
    pub async fn put_file(
        &mut self,
        local: &std::path::Path,
        remote: &str,
        settings: &TransferConfig,
        control: Option<Arc<TransferControlBlock>>,
    ) -> Result<u64> {
        let size = tokio::fs::metadata(local)
            .await
            .map_err(local_io(format!("failed reading metadata of {local:?}")))?
            .len();
        let threads = settings.threads_for(size);
        let mut input = DataObjInp::new(remote, api::PUT_OPR);
        input.create_mode = 0o644;
        input.open_flags = api::O_WRONLY | api::O_CREAT | api::O_TRUNC;
        input.data_size = size as i64;
        input.num_threads = threads as i32;
        if !self.account.default_resource().is_empty() {
            input
                .options
                .insert(api::DEST_RESC_NAME_KW, self.account.default_resource());
        }
        if settings.force_overwrite {
            input.options.insert(api::FORCE_FLAG_KW, "");
        }
        if threads == 0 {
            let file = tokio::fs::File::open(local)
                .await
                .map_err(local_io(format!("cannot open {local:?} for reading")))?;
            let mut reader = tokio::io::BufReader::with_capacity(settings.io_buffer_size, file);
            let body = input.to_tag();
            self.connection
                .api_request_with_stream(ApiNumber::DataObjPut, Some(&body), &mut reader, size)
                .await?;
            if let Some(control) = &control {
                control.add_bytes_transferred(size);
            }
            tracing::debug!("sent {} in-band", bytesize::ByteSize(size));
            return Ok(size);
        }
        let reply = self
            .connection
            .api_request(ApiNumber::DataObjPut, Some(&input.to_tag()))
            .await?;
        let portal = PortalOprOut::from_tag(reply.body()?)?;
        self.run_portal(&portal, local, size, Direction::Put, settings, control)
            .await
    }

    /// Downloads the data object `remote` (of `size` bytes) into the local file `local`, which is
    /// created or truncated. Returns the bytes received.
    #[tracing::instrument(level = "debug", skip(self, settings, control))]
    pub async fn get_file(
        &mut self,
        remote: &str,
        local: &std::path::Path,
        size: u64,
        settings: &TransferConfig,
        control: Option<Arc<TransferControlBlock>>,
    ) -> Result<u64> {
        let threads = settings.threads_for(size);
        let mut input = DataObjInp::new(remote, api::GET_OPR);
        input.open_flags = api::O_RDONLY;
        input.data_size = size as i64;
        input.num_threads = threads as i32;
        let file = tokio::fs::File::create(local)
            .await
            .map_err(local_io(format!("cannot open {local:?} for writing")))?;
        let mut writer = tokio::io::BufWriter::with_capacity(settings.io_buffer_size, file);
        let (reply, written) = self
            .connection
            .api_request_into(ApiNumber::DataObjGet, Some(&input.to_tag()), &mut writer)
            .await?;
        let portal = match &reply.body {
            Some(body) => PortalOprOut::from_tag(body)?,
            None => PortalOprOut::default(),
        };
        if portal.num_threads <= 0 {
            if written != size {
                return Err(Error::transfer(format!(
                    "received {written} bytes of {remote}, expected {size}"
                )));
            }
            if let Some(control) = &control {
                control.add_bytes_transferred(written);
            }
            tracing::debug!("received {} in-band", bytesize::ByteSize(written));
            return Ok(written);
        }
        writer
            .into_inner()
            .set_len(size)
            .await
            .map_err(local_io(format!("failed sizing {local:?}")))?;
        self.run_portal(&portal, local, size, Direction::Get, settings, control)
            .await
    }

    async fn run_portal(
        &mut self,
        portal: &PortalOprOut,
        local: &std::path::Path,
        size: u64,
        direction: Direction,
        settings: &TransferConfig,
        control: Option<Arc<TransferControlBlock>>,
    ) -> Result<u64> {
        let strategy =
            ParallelTransferStrategy::from_portal(portal, self.account.host(), local, size)?;
        tracing::debug!(
            "parallel {direction} of {} over {} streams",
            bytesize::ByteSize(size),
            strategy.num_threads
        );
        let transfer =
            parallel::execute(&strategy, direction, settings.io_buffer_size, control).await;
        // the server holds the descriptor open until the operation is completed, even on failure
        let complete = self
            .connection
            .api_request(ApiNumber::OprComplete, Some(&int_pi(portal.l1desc_inx)))
            .await;
        let summary = transfer?;
        complete?;
        Ok(summary.bytes_transferred)
    }

    /// Ends the session. The connection is closed even if the goodbye message cannot be sent.
    pub async fn disconnect(mut self) -> Result<()> {
        if self.connection.is_closed() {
            return Ok(());
        }
        let goodbye = self
            .connection
            .send_message(api::RODS_DISCONNECT, None, 0)
            .await;
        self.connection.close().await?;
        goodbye
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{MockGrid, MockGridConfig};
    use tracing_test::traced_test;

    async fn open(grid: &MockGrid) -> Result<Session> {
        Session::open(grid.account()?, &ConnectionConfig::default()).await
    }

    fn parallel_settings() -> TransferConfig {
        TransferConfig {
            parallel_threshold: 1024,
            max_parallel_threads: 3,
            io_buffer_size: 256,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn catalog_operations() -> anyhow::Result<()> {
        let grid = MockGrid::start(MockGridConfig::default()).await?;
        let home = grid.home();
        grid.add_object(&format!("{home}/b.txt"), "bb");
        grid.add_object(&format!("{home}/a.txt"), "a");
        grid.add_object(&format!("{home}/sub/c.txt"), "ccc");
        let mut session = open(&grid).await?;
        assert_eq!(session.auth_result().user, "rods");
        let stat = session.stat(&format!("{home}/b.txt")).await?;
        assert_eq!(
            stat.map(|stat| (stat.kind, stat.size)),
            Some((ObjectKind::DataObject, 2))
        );
        assert!(session.stat(&home).await?.is_some_and(|stat| stat.is_collection()));
        assert_eq!(session.stat(&format!("{home}/missing")).await?, None);
        let names: Vec<_> = session
            .list_collection(&home)
            .await?
            .into_iter()
            .map(|entry| (entry.name, entry.kind))
            .collect();
        assert_eq!(
            names,
            vec![
                ("sub".to_string(), ObjectKind::Collection),
                ("a.txt".to_string(), ObjectKind::DataObject),
                ("b.txt".to_string(), ObjectKind::DataObject),
            ]
        );
        assert_eq!(session.count_files(&home).await?, 3);
        session.create_collection(&format!("{home}/x/y")).await?;
        // already there
        session.create_collection(&format!("{home}/x/y")).await?;
        assert!(grid.has_collection(&format!("{home}/x")));
        assert!(session.list_collection(&format!("{home}/x/y")).await?.is_empty());
        session.disconnect().await?;
        Ok(())
    }

    #[tokio::test]
    async fn listing_follows_continuation() -> anyhow::Result<()> {
        let grid = MockGrid::start(MockGridConfig {
            query_page_size: 2,
            ..Default::default()
        })
        .await?;
        let home = grid.home();
        for index in 0..5 {
            grid.add_object(&format!("{home}/f{index}"), vec![0u8; index]);
        }
        let mut session = open(&grid).await?;
        let entries = session.list_collection(&home).await?;
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[4].size, 4);
        // three pages of data objects plus one empty query for sub-collections
        assert_eq!(grid.api_call_count(ApiNumber::GenQuery), 4);
        Ok(())
    }

    #[tokio::test]
    async fn in_band_round_trip() -> anyhow::Result<()> {
        let grid = MockGrid::start(MockGridConfig::default()).await?;
        let tmp = tempfile::tempdir()?;
        let local = tmp.path().join("small.bin");
        tokio::fs::write(&local, b"hello grid").await?;
        let remote = format!("{}/small.bin", grid.home());
        let mut session = open(&grid).await?;
        let settings = TransferConfig::default();
        let control = Arc::new(TransferControlBlock::new());
        assert_eq!(
            session
                .put_file(&local, &remote, &settings, Some(control.clone()))
                .await?,
            10
        );
        assert_eq!(grid.object(&remote).map(|object| object.data), Some(b"hello grid".to_vec()));
        let back = tmp.path().join("back.bin");
        session.get_file(&remote, &back, 10, &settings, Some(control.clone())).await?;
        assert_eq!(tokio::fs::read(&back).await?, b"hello grid");
        assert_eq!(control.bytes_transferred(), 20);
        assert!(grid.directives().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn put_without_force_refuses_overwrite() -> anyhow::Result<()> {
        let grid = MockGrid::start(MockGridConfig::default()).await?;
        let remote = format!("{}/exists", grid.home());
        grid.add_object(&remote, "old");
        let tmp = tempfile::tempdir()?;
        let local = tmp.path().join("new");
        tokio::fs::write(&local, b"new").await?;
        let mut session = open(&grid).await?;
        let error = session
            .put_file(&local, &remote, &TransferConfig::default(), None)
            .await
            .unwrap_err();
        assert_eq!(
            error.server_code().map(base_code),
            Some(api::OVERWRITE_WITHOUT_FORCE_FLAG)
        );
        // the session survives a server-side failure
        let settings = TransferConfig {
            force_overwrite: true,
            ..Default::default()
        };
        session.put_file(&local, &remote, &settings, None).await?;
        assert_eq!(grid.object(&remote).map(|object| object.data), Some(b"new".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn parallel_round_trip() -> anyhow::Result<()> {
        let grid = MockGrid::start(MockGridConfig {
            chunk_size: 1000,
            ..Default::default()
        })
        .await?;
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let tmp = tempfile::tempdir()?;
        let local = tmp.path().join("big.bin");
        tokio::fs::write(&local, &data).await?;
        let remote = format!("{}/big.bin", grid.home());
        let settings = parallel_settings();
        let mut session = open(&grid).await?;
        assert_eq!(session.put_file(&local, &remote, &settings, None).await?, 10_000);
        assert_eq!(grid.object(&remote).map(|object| object.data), Some(data.clone()));
        let directives = grid.directives();
        let streams: std::collections::BTreeSet<_> =
            directives.iter().map(|record| record.stream_id).collect();
        assert_eq!(streams.len(), 3);
        for stream in streams {
            let offsets: Vec<_> = directives
                .iter()
                .filter(|record| record.stream_id == stream)
                .map(|record| record.offset)
                .collect();
            assert!(offsets.windows(2).all(|pair| pair[0] < pair[1]), "{offsets:?}");
        }
        let back = tmp.path().join("back.bin");
        assert_eq!(
            session.get_file(&remote, &back, 10_000, &settings, None).await?,
            10_000
        );
        assert_eq!(tokio::fs::read(&back).await?, data);
        assert_eq!(grid.api_call_count(ApiNumber::OprComplete), 2);
        Ok(())
    }

    #[tokio::test]
    async fn rename_replicate_and_move() -> anyhow::Result<()> {
        let grid = MockGrid::start(MockGridConfig::default()).await?;
        let home = grid.home();
        grid.add_object(&format!("{home}/dir/file"), "x");
        grid.add_collection(&format!("{home}/target"));
        let mut session = open(&grid).await?;
        session
            .rename(
                &format!("{home}/dir/file"),
                &format!("{home}/dir/renamed"),
                ObjectKind::DataObject,
            )
            .await?;
        session
            .rename(&format!("{home}/dir"), &format!("{home}/target/dir"), ObjectKind::Collection)
            .await?;
        let moved = format!("{home}/target/dir/renamed");
        assert!(grid.object(&moved).is_some());
        assert!(!grid.has_collection(&format!("{home}/dir")));
        session.replicate(&moved, "archiveResc").await?;
        let resources = grid.object(&moved).map(|object| object.resources).unwrap_or_default();
        assert_eq!(resources.len(), 2);
        session.physical_move(&moved, "fastResc").await?;
        let resources = grid.object(&moved).map(|object| object.resources).unwrap_or_default();
        assert_eq!(resources.into_iter().collect::<Vec<_>>(), vec!["fastResc".to_string()]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn authentication() -> anyhow::Result<()> {
        let grid = MockGrid::start(MockGridConfig::default()).await?;
        let session = Session::open(grid.pam_account()?, &ConnectionConfig::default()).await?;
        assert_eq!(session.auth_result().scheme, crate::account::AuthScheme::Pam);
        session.disconnect().await?;
        let wrong = Account::new(
            grid.address().ip().to_string(),
            grid.address().port(),
            "rods",
            "tempZone",
            "not-the-password",
        )?;
        let error = Session::open(wrong, &ConnectionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Authentication(_)), "{error:?}");
        let wrong_pam = Account::new(
            grid.address().ip().to_string(),
            grid.address().port(),
            "rods",
            "tempZone",
            "nope",
        )?
        .with_scheme(crate::account::AuthScheme::Pam);
        let error = Session::open(wrong_pam, &ConnectionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Authentication(_)), "{error:?}");
        assert!(logs_contain("authentication of rods failed"));
        assert!(!logs_contain("not-the-password"));
        assert!(!logs_contain("pam-secret"));
        Ok(())
    }
}
