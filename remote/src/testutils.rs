//! In-process grid server for tests.
//!
//! [`MockGrid`] speaks enough of the protocol to exercise every client operation: startup,
//! native and PAM authentication, object stat, collection create and listing, in-band and
//! parallel put/get, replication, physical move and rename. The catalog lives in memory and can
//! be seeded and inspected by the test.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::config::ConnectionConfig;
use common::error::{Error, Result};
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::account::{Account, AuthScheme};
use crate::auth::{CHALLENGE_LEN, challenge_response};
use crate::connection::{Connection, Message};
use crate::parallel::{Directive, Operation};
use crate::path;
use crate::protocol::Tag;
use crate::protocol::api::{self, ApiNumber};
use crate::protocol::messages::{
    self, CollInp, DataObjCopyInp, DataObjInp, GenQueryInp, GenQueryOut, PortalOprOut, RodsObjStat,
    StartupPack, StartupResponse,
};

const PORTAL_ACCEPT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct MockGridConfig {
    pub zone: String,
    pub user: String,
    pub password: String,
    /// Password accepted by the PAM exchange.
    pub pam_password: String,
    pub default_resource: String,
    /// Upper bound on the streams granted for a parallel transfer.
    pub max_threads: usize,
    /// Largest range sent in one directive.
    pub chunk_size: u64,
    /// Rows returned per catalog query page.
    pub query_page_size: usize,
    /// Data object paths whose put/get/replicate/phymv/rename fail with a privilege error.
    pub reject_paths: Vec<String>,
    /// Portal stream that hangs up right after its first directive; a GET stream sends half of
    /// the range first.
    pub broken_stream: Option<usize>,
}

impl Default for MockGridConfig {
    fn default() -> Self {
        Self {
            zone: "tempZone".to_string(),
            user: "rods".to_string(),
            password: "rods".to_string(),
            pam_password: "pam-secret".to_string(),
            default_resource: "demoResc".to_string(),
            max_threads: 4,
            chunk_size: 64 * 1024,
            query_page_size: 256,
            reject_paths: Vec::new(),
            broken_stream: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub resources: BTreeSet<String>,
}

/// One directive sent over a portal stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectiveRecord {
    pub stream_id: usize,
    pub operation: Operation,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Default)]
struct Catalog {
    collections: BTreeSet<String>,
    objects: BTreeMap<String, StoredObject>,
    temporary_passwords: HashSet<String>,
    api_calls: Vec<ApiNumber>,
    directives: Vec<DirectiveRecord>,
}

#[derive(Debug)]
struct Shared {
    config: MockGridConfig,
    catalog: Mutex<Catalog>,
    counter: AtomicI32,
}

impl Shared {
    fn catalog(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next(&self) -> i32 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub struct MockGrid {
    address: SocketAddr,
    shared: Arc<Shared>,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for MockGrid {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl MockGrid {
    /// Starts a server on an ephemeral localhost port with the user's home collection in place.
    pub async fn start(config: MockGridConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|source| Error::connection("failed binding mock grid", source))?;
        let address = listener
            .local_addr()
            .map_err(|source| Error::connection("failed reading mock grid address", source))?;
        let home = format!("/{}/home/{}", config.zone, config.user);
        let shared = Arc::new(Shared {
            config,
            catalog: Mutex::new(Catalog::default()),
            counter: AtomicI32::new(0),
        });
        add_collection_tree(&mut shared.catalog(), &home);
        let server = tokio::spawn(accept_loop(listener, shared.clone()));
        tracing::debug!("mock grid listening on {address}");
        Ok(Self {
            address,
            shared,
            server,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn config(&self) -> &MockGridConfig {
        &self.shared.config
    }

    pub fn home(&self) -> String {
        format!("/{}/home/{}", self.shared.config.zone, self.shared.config.user)
    }

    /// Native account of the configured user.
    pub fn account(&self) -> Result<Account> {
        let config = &self.shared.config;
        Account::new(
            self.address.ip().to_string(),
            self.address.port(),
            &config.user,
            &config.zone,
            &config.password,
        )
    }

    /// PAM account of the configured user.
    pub fn pam_account(&self) -> Result<Account> {
        let config = &self.shared.config;
        Ok(Account::new(
            self.address.ip().to_string(),
            self.address.port(),
            &config.user,
            &config.zone,
            &config.pam_password,
        )?
        .with_scheme(AuthScheme::Pam))
    }

    /// Adds a collection and its missing parents.
    pub fn add_collection(&self, path: &str) {
        add_collection_tree(&mut self.shared.catalog(), path);
    }

    /// Adds a data object on the default resource, creating missing parent collections.
    pub fn add_object(&self, path: &str, data: impl Into<Vec<u8>>) {
        let mut catalog = self.shared.catalog();
        add_collection_tree(&mut catalog, path::parent(path));
        catalog.objects.insert(
            path.to_string(),
            StoredObject {
                data: data.into(),
                resources: BTreeSet::from([self.shared.config.default_resource.clone()]),
            },
        );
    }

    pub fn object(&self, path: &str) -> Option<StoredObject> {
        self.shared.catalog().objects.get(path).cloned()
    }

    pub fn has_collection(&self, path: &str) -> bool {
        self.shared.catalog().collections.contains(path)
    }

    pub fn object_paths(&self) -> Vec<String> {
        self.shared.catalog().objects.keys().cloned().collect()
    }

    /// API numbers of all requests received so far, in order.
    pub fn api_calls(&self) -> Vec<ApiNumber> {
        self.shared.catalog().api_calls.clone()
    }

    pub fn api_call_count(&self, api_number: ApiNumber) -> usize {
        self.shared
            .catalog()
            .api_calls
            .iter()
            .filter(|call| **call == api_number)
            .count()
    }

    /// Directives sent over portal streams so far.
    pub fn directives(&self) -> Vec<DirectiveRecord> {
        self.shared.catalog().directives.clone()
    }
}

fn add_collection_tree(catalog: &mut Catalog, path: &str) {
    let mut current = path.trim_end_matches('/').to_string();
    loop {
        if current.is_empty() {
            current = "/".to_string();
        }
        let parent = path::parent(&current).to_string();
        let done = current == "/";
        catalog.collections.insert(current);
        if done {
            break;
        }
        current = parent;
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                tracing::error!("mock grid accept failed: {error}");
                return;
            }
        };
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(error) = serve_client(stream, shared).await {
                tracing::debug!("mock grid client {peer} ended: {error}");
            }
        });
    }
}

/// Failed request: error code and message sent back in the error stack.
struct Failure {
    code: i32,
    message: String,
}

impl Failure {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Failure::new(api::SYS_INVALID_INPUT_PARAM, error.to_string())
    }
}

#[derive(Default)]
struct Reply {
    body: Option<Tag>,
    byte_stream: Vec<u8>,
}

impl Reply {
    fn body(body: Tag) -> Self {
        Self {
            body: Some(body),
            byte_stream: Vec::new(),
        }
    }
}

type Handled = std::result::Result<Reply, Failure>;

enum PendingPortal {
    Put {
        path: String,
        resource: String,
        task: tokio::task::JoinHandle<Result<Vec<u8>>>,
    },
    Get {
        task: tokio::task::JoinHandle<Result<Vec<u8>>>,
    },
}

struct ClientHandler {
    shared: Arc<Shared>,
    challenge: Option<Vec<u8>>,
    authenticated: bool,
    portals: HashMap<i32, PendingPortal>,
}

async fn serve_client(stream: TcpStream, shared: Arc<Shared>) -> Result<()> {
    let mut connection = Connection::from_stream(stream, &ConnectionConfig::default())?;
    let startup = connection.read_message().await?;
    if startup.header.msg_type != api::RODS_CONNECT {
        return Err(Error::protocol(format!(
            "expected {} first, received {}",
            api::RODS_CONNECT,
            startup.header.msg_type
        )));
    }
    let pack = StartupPack::from_tag(startup.body()?)?;
    tracing::debug!("mock grid startup from {}#{}", pack.client_user, pack.client_zone);
    let version = StartupResponse {
        status: 0,
        release_version: api::RELEASE_VERSION.to_string(),
        api_version: api::API_VERSION.to_string(),
        reconnect_port: 0,
        reconnect_address: String::new(),
        cookie: 400,
    };
    connection
        .send_message(api::RODS_VERSION, Some(&version.to_tag()), 0)
        .await?;
    let mut handler = ClientHandler {
        shared,
        challenge: None,
        authenticated: false,
        portals: HashMap::new(),
    };
    loop {
        let request = match connection.read_message().await {
            Ok(request) => request,
            // client went away without saying goodbye
            Err(_) if connection.is_closed() => return Ok(()),
            Err(error) => return Err(error),
        };
        match request.header.msg_type.as_str() {
            api::RODS_DISCONNECT => return connection.close().await,
            api::RODS_API_REQ => {}
            other => return Err(Error::protocol(format!("unexpected message type {other}"))),
        }
        let outcome = match ApiNumber::from_code(request.header.int_info) {
            Some(api_number) => {
                handler.shared.catalog().api_calls.push(api_number);
                handler.handle(api_number, &request).await
            }
            None => Err(Failure::new(
                api::SYS_UNMATCHED_API_NUM,
                format!("unknown API number {}", request.header.int_info),
            )),
        };
        match outcome {
            Ok(reply) => {
                connection
                    .send_reply(
                        api::RODS_API_REPLY,
                        reply.body.as_ref(),
                        None,
                        &reply.byte_stream,
                        0,
                    )
                    .await?
            }
            Err(failure) => {
                let error = messages::rerror(&[(failure.code, failure.message)]);
                connection
                    .send_reply(api::RODS_API_REPLY, None, Some(&error), &[], failure.code)
                    .await?
            }
        }
    }
}

fn body(request: &Message) -> std::result::Result<&Tag, Failure> {
    request.body().map_err(Failure::from)
}

fn generate_challenge(seed: i32) -> Vec<u8> {
    let mut challenge = Vec::with_capacity(CHALLENGE_LEN);
    let mut block = 0u8;
    while challenge.len() < CHALLENGE_LEN {
        let mut hasher = Md5::new();
        hasher.update(seed.to_be_bytes());
        hasher.update([block]);
        challenge.extend_from_slice(hasher.finalize().as_slice());
        block += 1;
    }
    challenge.truncate(CHALLENGE_LEN);
    challenge
}

/// Splits `[0, size)` into one contiguous range per stream.
fn split_ranges(size: u64, streams: usize) -> Vec<(u64, u64)> {
    let streams = streams.max(1) as u64;
    let per_stream = size.div_ceil(streams);
    (0..streams)
        .map(|index| {
            let offset = (index * per_stream).min(size);
            let end = (offset + per_stream).min(size);
            (offset, end - offset)
        })
        .collect()
}

impl ClientHandler {
    fn config(&self) -> &MockGridConfig {
        &self.shared.config
    }

    async fn handle(&mut self, api_number: ApiNumber, request: &Message) -> Handled {
        match api_number {
            ApiNumber::AuthRequest => return self.auth_request(),
            ApiNumber::AuthResponse => return self.auth_response(request),
            ApiNumber::PamAuthRequest => return self.pam_auth_request(request),
            _ => {}
        }
        if !self.authenticated {
            return Err(Failure::new(
                api::CAT_INSUFFICIENT_PRIVILEGE_LEVEL,
                "client is not authenticated",
            ));
        }
        match api_number {
            ApiNumber::ObjStat => self.obj_stat(request),
            ApiNumber::CollCreate => self.coll_create(request),
            ApiNumber::GenQuery => self.gen_query(request),
            ApiNumber::DataObjPut => self.put(request).await,
            ApiNumber::DataObjGet => self.get(request).await,
            ApiNumber::OprComplete => self.opr_complete(request).await,
            ApiNumber::DataObjRepl => self.replicate(request),
            ApiNumber::DataObjPhymv => self.phymv(request),
            ApiNumber::DataObjRename => self.rename(request),
            other => Err(Failure::new(
                api::SYS_UNMATCHED_API_NUM,
                format!("{other} is not a client request"),
            )),
        }
    }

    fn auth_request(&mut self) -> Handled {
        let challenge = generate_challenge(self.shared.next());
        let encoded = STANDARD.encode(&challenge);
        self.challenge = Some(challenge);
        Ok(Reply::body(messages::auth_request_out(&encoded)))
    }

    fn auth_response(&mut self, request: &Message) -> Handled {
        let (response, username) = messages::parse_auth_response_inp(body(request)?)?;
        let Some(challenge) = self.challenge.take() else {
            return Err(Failure::new(
                api::CAT_INVALID_AUTHENTICATION,
                "no challenge was issued",
            ));
        };
        if username != self.config().user {
            return Err(Failure::new(
                api::CAT_INVALID_USER,
                format!("unknown user {username}"),
            ));
        }
        let mut candidates = vec![self.config().password.clone()];
        candidates.extend(self.shared.catalog().temporary_passwords.iter().cloned());
        let accepted = candidates.iter().any(|password| {
            challenge_response(&challenge, password).is_ok_and(|expected| expected == response)
        });
        if !accepted {
            return Err(Failure::new(
                api::CAT_INVALID_AUTHENTICATION,
                "invalid challenge response",
            ));
        }
        self.authenticated = true;
        Ok(Reply::default())
    }

    fn pam_auth_request(&mut self, request: &Message) -> Handled {
        let (user, password, _time_to_live) = messages::parse_pam_auth_request_inp(body(request)?)?;
        if user != self.config().user || password != self.config().pam_password {
            return Err(Failure::new(
                api::PAM_AUTH_PASSWORD_FAILED,
                format!("PAM rejected {user}"),
            ));
        }
        let temporary = format!("pam-temporary-{}", self.shared.next());
        self.shared
            .catalog()
            .temporary_passwords
            .insert(temporary.clone());
        Ok(Reply::body(messages::pam_auth_request_out(&temporary)))
    }

    fn check_allowed(&self, path: &str) -> std::result::Result<(), Failure> {
        if self.config().reject_paths.iter().any(|rejected| rejected == path) {
            return Err(Failure::new(
                api::CAT_INSUFFICIENT_PRIVILEGE_LEVEL,
                format!("access to {path} denied"),
            ));
        }
        Ok(())
    }

    fn obj_stat(&self, request: &Message) -> Handled {
        let input = DataObjInp::from_tag(body(request)?)?;
        let catalog = self.shared.catalog();
        let stat = if let Some(object) = catalog.objects.get(&input.path) {
            RodsObjStat {
                size: object.data.len() as i64,
                obj_type: api::DATA_OBJ_T,
                owner_name: self.config().user.clone(),
                owner_zone: self.config().zone.clone(),
                modify_time: "0".to_string(),
            }
        } else if catalog.collections.contains(&input.path) {
            RodsObjStat {
                size: 0,
                obj_type: api::COLL_OBJ_T,
                owner_name: self.config().user.clone(),
                owner_zone: self.config().zone.clone(),
                modify_time: "0".to_string(),
            }
        } else {
            return Err(Failure::new(
                api::USER_FILE_DOES_NOT_EXIST,
                format!("{} does not exist", input.path),
            ));
        };
        Ok(Reply::body(stat.to_tag()))
    }

    fn coll_create(&self, request: &Message) -> Handled {
        let input = CollInp::from_tag(body(request)?)?;
        let mut catalog = self.shared.catalog();
        if catalog.collections.contains(&input.name) || catalog.objects.contains_key(&input.name) {
            return Err(Failure::new(
                api::CAT_ALREADY_HAS_ITEM_BY_THAT_NAME,
                format!("{} already exists", input.name),
            ));
        }
        let parent = path::parent(&input.name);
        if input.options.get(api::RECURSIVE_OPR_KW).is_some() {
            add_collection_tree(&mut catalog, &input.name);
        } else if catalog.collections.contains(parent) {
            catalog.collections.insert(input.name.clone());
        } else {
            return Err(Failure::new(
                api::USER_FILE_DOES_NOT_EXIST,
                format!("parent collection {parent} does not exist"),
            ));
        }
        Ok(Reply::default())
    }

    fn gen_query(&self, request: &Message) -> Handled {
        let input = GenQueryInp::from_tag(body(request)?)?;
        let Some((column, condition)) = input.conditions.first() else {
            return Err(Failure::new(api::SYS_INVALID_INPUT_PARAM, "query without condition"));
        };
        let Some(target) = condition
            .trim()
            .strip_prefix("= '")
            .and_then(|rest| rest.strip_suffix('\''))
        else {
            return Err(Failure::new(
                api::SYS_INVALID_INPUT_PARAM,
                format!("unsupported condition {condition:?}"),
            ));
        };
        let catalog = self.shared.catalog();
        // each row maps a column number to its value
        let rows: Vec<HashMap<i32, String>> = match *column {
            api::COL_COLL_PARENT_NAME => catalog
                .collections
                .iter()
                .filter(|collection| {
                    collection.as_str() != target && path::parent(collection) == target
                })
                .map(|collection| HashMap::from([(api::COL_COLL_NAME, collection.clone())]))
                .collect(),
            api::COL_COLL_NAME => catalog
                .objects
                .iter()
                .filter(|(object, _)| path::parent(object) == target)
                .map(|(object, stored)| {
                    HashMap::from([
                        (api::COL_DATA_NAME, path::file_name(object).to_string()),
                        (api::COL_DATA_SIZE, stored.data.len().to_string()),
                        (api::COL_COLL_NAME, target.to_string()),
                    ])
                })
                .collect(),
            other => {
                return Err(Failure::new(
                    api::SYS_INVALID_INPUT_PARAM,
                    format!("unsupported condition column {other}"),
                ));
            }
        };
        let start = usize::try_from(input.continue_inx).unwrap_or(0);
        if rows.is_empty() || start >= rows.len() {
            return Err(Failure::new(api::CAT_NO_ROWS_FOUND, "no rows found"));
        }
        let page = self
            .config()
            .query_page_size
            .min(usize::try_from(input.max_rows).unwrap_or(1))
            .max(1);
        let end = (start + page).min(rows.len());
        let columns = input
            .select
            .iter()
            .map(|column| {
                let values = rows[start..end]
                    .iter()
                    .map(|row| row.get(column).cloned().unwrap_or_default())
                    .collect();
                (*column, values)
            })
            .collect();
        let out = GenQueryOut {
            row_count: end - start,
            continue_inx: if end < rows.len() { end as i32 } else { 0 },
            columns,
        };
        Ok(Reply::body(out.to_tag()))
    }

    fn granted_threads(&self, requested: i32) -> usize {
        usize::try_from(requested)
            .unwrap_or(0)
            .min(self.config().max_threads)
    }

    async fn open_portal(&self) -> std::result::Result<(TcpListener, u16, i32), Failure> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|error| Failure::new(api::SYS_INVALID_INPUT_PARAM, error.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|error| Failure::new(api::SYS_INVALID_INPUT_PARAM, error.to_string()))?
            .port();
        let cookie = 0x5eed + self.shared.next() * 7919;
        Ok((listener, port, cookie))
    }

    async fn put(&mut self, request: &Message) -> Handled {
        let input = DataObjInp::from_tag(body(request)?)?;
        self.check_allowed(&input.path)?;
        {
            let catalog = self.shared.catalog();
            if !catalog.collections.contains(path::parent(&input.path)) {
                return Err(Failure::new(
                    api::USER_FILE_DOES_NOT_EXIST,
                    format!("collection {} does not exist", path::parent(&input.path)),
                ));
            }
            if catalog.collections.contains(&input.path) {
                return Err(Failure::new(
                    api::CAT_ALREADY_HAS_ITEM_BY_THAT_NAME,
                    format!("{} is a collection", input.path),
                ));
            }
            if catalog.objects.contains_key(&input.path)
                && input.options.get(api::FORCE_FLAG_KW).is_none()
            {
                return Err(Failure::new(
                    api::OVERWRITE_WITHOUT_FORCE_FLAG,
                    format!("{} exists", input.path),
                ));
            }
        }
        let resource = input
            .options
            .get(api::DEST_RESC_NAME_KW)
            .unwrap_or(&self.config().default_resource)
            .to_string();
        let threads = self.granted_threads(input.num_threads);
        if threads == 0 {
            self.store(&input.path, &resource, request.byte_stream.clone());
            return Ok(Reply::default());
        }
        let size = u64::try_from(input.data_size).unwrap_or(0);
        let (listener, port, cookie) = self.open_portal().await?;
        let l1desc = self.shared.next();
        let task = tokio::spawn(run_portal(
            listener,
            cookie,
            PortalData::Put { size },
            threads,
            self.shared.clone(),
        ));
        self.portals.insert(
            l1desc,
            PendingPortal::Put {
                path: input.path.clone(),
                resource,
                task,
            },
        );
        Ok(Reply::body(
            PortalOprOut {
                status: 0,
                l1desc_inx: l1desc,
                num_threads: threads as i32,
                port: i32::from(port),
                cookie,
                window_size: 0,
                host: "127.0.0.1".to_string(),
            }
            .to_tag(),
        ))
    }

    fn store(&self, path: &str, resource: &str, data: Vec<u8>) {
        self.shared.catalog().objects.insert(
            path.to_string(),
            StoredObject {
                data,
                resources: BTreeSet::from([resource.to_string()]),
            },
        );
    }

    async fn get(&mut self, request: &Message) -> Handled {
        let input = DataObjInp::from_tag(body(request)?)?;
        self.check_allowed(&input.path)?;
        let Some(object) = self.shared.catalog().objects.get(&input.path).cloned() else {
            return Err(Failure::new(
                api::USER_FILE_DOES_NOT_EXIST,
                format!("{} does not exist", input.path),
            ));
        };
        let threads = self.granted_threads(input.num_threads);
        if threads == 0 || object.data.is_empty() {
            return Ok(Reply {
                body: Some(PortalOprOut::default().to_tag()),
                byte_stream: object.data,
            });
        }
        let (listener, port, cookie) = self.open_portal().await?;
        let l1desc = self.shared.next();
        let task = tokio::spawn(run_portal(
            listener,
            cookie,
            PortalData::Get {
                data: Arc::new(object.data),
            },
            threads,
            self.shared.clone(),
        ));
        self.portals.insert(l1desc, PendingPortal::Get { task });
        Ok(Reply::body(
            PortalOprOut {
                status: 0,
                l1desc_inx: l1desc,
                num_threads: threads as i32,
                port: i32::from(port),
                cookie,
                window_size: 0,
                host: "127.0.0.1".to_string(),
            }
            .to_tag(),
        ))
    }

    async fn opr_complete(&mut self, request: &Message) -> Handled {
        let l1desc = messages::parse_int_pi(body(request)?)?;
        let Some(pending) = self.portals.remove(&l1desc) else {
            return Err(Failure::new(
                api::SYS_INVALID_INPUT_PARAM,
                format!("no open descriptor {l1desc}"),
            ));
        };
        type Outcome = std::result::Result<Result<Vec<u8>>, tokio::task::JoinError>;
        let joined = |outcome: Outcome| match outcome {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(error)) => Err(Failure::new(api::SYS_INVALID_INPUT_PARAM, error.to_string())),
            Err(error) => Err(Failure::new(api::SYS_INVALID_INPUT_PARAM, error.to_string())),
        };
        match pending {
            PendingPortal::Put {
                path,
                resource,
                task,
            } => {
                let data = joined(task.await)?;
                self.store(&path, &resource, data);
            }
            PendingPortal::Get { task } => {
                joined(task.await)?;
            }
        }
        Ok(Reply::default())
    }

    fn replicate(&self, request: &Message) -> Handled {
        let input = DataObjInp::from_tag(body(request)?)?;
        self.check_allowed(&input.path)?;
        let Some(resource) = input.options.get(api::DEST_RESC_NAME_KW) else {
            return Err(Failure::new(api::SYS_INVALID_INPUT_PARAM, "no target resource"));
        };
        let mut catalog = self.shared.catalog();
        let Some(object) = catalog.objects.get_mut(&input.path) else {
            return Err(Failure::new(
                api::USER_FILE_DOES_NOT_EXIST,
                format!("{} does not exist", input.path),
            ));
        };
        object.resources.insert(resource.to_string());
        Ok(Reply::default())
    }

    fn phymv(&self, request: &Message) -> Handled {
        let input = DataObjInp::from_tag(body(request)?)?;
        self.check_allowed(&input.path)?;
        let Some(resource) = input.options.get(api::DEST_RESC_NAME_KW) else {
            return Err(Failure::new(api::SYS_INVALID_INPUT_PARAM, "no target resource"));
        };
        let mut catalog = self.shared.catalog();
        let Some(object) = catalog.objects.get_mut(&input.path) else {
            return Err(Failure::new(
                api::USER_FILE_DOES_NOT_EXIST,
                format!("{} does not exist", input.path),
            ));
        };
        object.resources = BTreeSet::from([resource.to_string()]);
        Ok(Reply::default())
    }

    fn rename(&self, request: &Message) -> Handled {
        let input = DataObjCopyInp::from_tag(body(request)?)?;
        let source = input.source.path;
        let target = input.destination.path;
        self.check_allowed(&source)?;
        let mut catalog = self.shared.catalog();
        if catalog.objects.contains_key(&target) || catalog.collections.contains(&target) {
            return Err(Failure::new(
                api::CAT_ALREADY_HAS_ITEM_BY_THAT_NAME,
                format!("{target} already exists"),
            ));
        }
        if !catalog.collections.contains(path::parent(&target)) {
            return Err(Failure::new(
                api::USER_FILE_DOES_NOT_EXIST,
                format!("collection {} does not exist", path::parent(&target)),
            ));
        }
        match input.source.opr_type {
            api::RENAME_DATA_OBJ => {
                let Some(object) = catalog.objects.remove(&source) else {
                    return Err(Failure::new(
                        api::USER_FILE_DOES_NOT_EXIST,
                        format!("{source} does not exist"),
                    ));
                };
                catalog.objects.insert(target, object);
            }
            api::RENAME_COLL => {
                if !catalog.collections.contains(&source) {
                    return Err(Failure::new(
                        api::USER_FILE_DOES_NOT_EXIST,
                        format!("{source} does not exist"),
                    ));
                }
                let prefix = format!("{source}/");
                let moved = |old: &str| format!("{target}{}", &old[source.len()..]);
                let collections: Vec<String> = catalog
                    .collections
                    .iter()
                    .filter(|c| **c == source || c.starts_with(&prefix))
                    .cloned()
                    .collect();
                for collection in collections {
                    catalog.collections.remove(&collection);
                    catalog.collections.insert(moved(&collection));
                }
                let objects: Vec<String> = catalog
                    .objects
                    .keys()
                    .filter(|o| o.starts_with(&prefix))
                    .cloned()
                    .collect();
                for object in objects {
                    if let Some(stored) = catalog.objects.remove(&object) {
                        catalog.objects.insert(moved(&object), stored);
                    }
                }
            }
            other => {
                return Err(Failure::new(
                    api::SYS_INVALID_INPUT_PARAM,
                    format!("invalid rename operation {other}"),
                ));
            }
        }
        Ok(Reply::default())
    }
}

enum PortalData {
    Put { size: u64 },
    Get { data: Arc<Vec<u8>> },
}

/// Accepts `threads` streams, checks their cookies and drives each through its range in chunks
/// of increasing offset. Returns the assembled data for a put.
async fn run_portal(
    listener: TcpListener,
    cookie: i32,
    data: PortalData,
    threads: usize,
    shared: Arc<Shared>,
) -> Result<Vec<u8>> {
    let size = match &data {
        PortalData::Put { size } => *size,
        PortalData::Get { data } => data.len() as u64,
    };
    let ranges = split_ranges(size, threads);
    let mut streams = tokio::task::JoinSet::new();
    for (stream_id, range) in ranges.into_iter().enumerate() {
        let (mut socket, _) = tokio::time::timeout(PORTAL_ACCEPT_TIMEOUT, listener.accept())
            .await
            .map_err(|_| Error::transfer(format!("portal stream {stream_id} never connected")))?
            .map_err(|source| Error::connection("portal accept failed", source))?;
        let received = socket
            .read_i32()
            .await
            .map_err(|source| Error::connection("failed reading portal cookie", source))?;
        if received != cookie {
            return Err(Error::protocol(format!(
                "portal stream {stream_id} sent cookie {received}, expected {cookie}"
            )));
        }
        let source = match &data {
            PortalData::Put { .. } => None,
            PortalData::Get { data } => Some(data.clone()),
        };
        let shared = shared.clone();
        streams.spawn(async move { drive_stream(stream_id, socket, range, source, shared).await });
    }
    let mut assembled = vec![0u8; size as usize];
    while let Some(joined) = streams.join_next().await {
        let pieces =
            joined.map_err(|error| Error::transfer(format!("portal stream failed: {error}")))??;
        for (offset, bytes) in pieces {
            let start = offset as usize;
            assembled[start..start + bytes.len()].copy_from_slice(&bytes);
        }
    }
    Ok(assembled)
}

async fn drive_stream(
    stream_id: usize,
    mut socket: TcpStream,
    (offset, length): (u64, u64),
    source: Option<Arc<Vec<u8>>>,
    shared: Arc<Shared>,
) -> Result<Vec<(u64, Vec<u8>)>> {
    let chunk_size = shared.config.chunk_size.max(1);
    let mut pieces = Vec::new();
    let mut position = offset;
    let end = offset + length;
    while position < end {
        let chunk = chunk_size.min(end - position);
        let operation = if source.is_some() {
            Operation::Get
        } else {
            Operation::Put
        };
        let directive = Directive {
            operation,
            flags: 0,
            offset: position as i64,
            length: chunk as i64,
        };
        directive.write_to(&mut socket).await?;
        shared.catalog().directives.push(DirectiveRecord {
            stream_id,
            operation,
            offset: position,
            length: chunk,
        });
        if shared.config.broken_stream == Some(stream_id) {
            if let Some(data) = &source {
                let start = position as usize;
                let half = (chunk / 2) as usize;
                socket
                    .write_all(&data[start..start + half])
                    .await
                    .map_err(|source| Error::connection("failed sending portal data", source))?;
            }
            return Err(Error::connection_closed(format!(
                "portal stream {stream_id} hung up"
            )));
        }
        match &source {
            Some(data) => {
                let start = position as usize;
                socket
                    .write_all(&data[start..start + chunk as usize])
                    .await
                    .map_err(|source| Error::connection("failed sending portal data", source))?;
            }
            None => {
                let mut bytes = vec![0u8; chunk as usize];
                socket
                    .read_exact(&mut bytes)
                    .await
                    .map_err(|source| Error::connection("failed receiving portal data", source))?;
                pieces.push((position, bytes));
            }
        }
        position += chunk;
    }
    Directive::done().write_to(&mut socket).await?;
    Ok(pieces)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_cover_the_whole_object() {
        let ranges = split_ranges(10, 3);
        assert_eq!(ranges, vec![(0, 4), (4, 4), (8, 2)]);
        assert_eq!(split_ranges(2, 4), vec![(0, 1), (1, 1), (2, 0), (2, 0)]);
    }

    #[test]
    fn challenge_has_protocol_length() {
        let challenge = generate_challenge(7);
        assert_eq!(challenge.len(), CHALLENGE_LEN);
        assert_ne!(challenge, generate_challenge(8));
    }

    #[tokio::test]
    async fn seeded_catalog() -> Result<()> {
        let grid = MockGrid::start(MockGridConfig::default()).await?;
        assert!(grid.has_collection("/tempZone/home/rods"));
        assert!(grid.has_collection("/tempZone"));
        assert!(grid.has_collection("/"));
        grid.add_object("/tempZone/home/rods/a/b.txt", "data");
        assert!(grid.has_collection("/tempZone/home/rods/a"));
        assert_eq!(
            grid.object("/tempZone/home/rods/a/b.txt").map(|o| o.data),
            Some(b"data".to_vec())
        );
        Ok(())
    }
}
