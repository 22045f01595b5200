//! Message types, API numbers and status codes of the iRODS protocol.

pub const RODS_CONNECT: &str = "RODS_CONNECT";
pub const RODS_VERSION: &str = "RODS_VERSION";
pub const RODS_API_REQ: &str = "RODS_API_REQ";
pub const RODS_API_REPLY: &str = "RODS_API_REPLY";
pub const RODS_DISCONNECT: &str = "RODS_DISCONNECT";

pub const RELEASE_VERSION: &str = "rods4.3.0";
pub const API_VERSION: &str = "d";
pub const XML_PROTOCOL: i32 = 1;
pub const RECONNECT_FLAG: i32 = 200;

/// API numbers carried in the `intInfo` field of an API request header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ApiNumber {
    DataObjPut = 606,
    DataObjGet = 608,
    DataObjRepl = 610,
    OprComplete = 626,
    DataObjRename = 627,
    DataObjPhymv = 631,
    ObjStat = 633,
    CollCreate = 681,
    GenQuery = 702,
    AuthRequest = 703,
    AuthResponse = 704,
    PamAuthRequest = 725,
}

impl ApiNumber {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let api = match code {
            606 => ApiNumber::DataObjPut,
            608 => ApiNumber::DataObjGet,
            610 => ApiNumber::DataObjRepl,
            626 => ApiNumber::OprComplete,
            627 => ApiNumber::DataObjRename,
            631 => ApiNumber::DataObjPhymv,
            633 => ApiNumber::ObjStat,
            681 => ApiNumber::CollCreate,
            702 => ApiNumber::GenQuery,
            703 => ApiNumber::AuthRequest,
            704 => ApiNumber::AuthResponse,
            725 => ApiNumber::PamAuthRequest,
            _ => return None,
        };
        Some(api)
    }
}

impl std::fmt::Display for ApiNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

// operation types of DataObjInp_PI
pub const PUT_OPR: i32 = 1;
pub const GET_OPR: i32 = 2;
pub const REPLICATE_OPR: i32 = 6;
pub const RENAME_DATA_OBJ: i32 = 11;
pub const RENAME_COLL: i32 = 12;
pub const PHYMV_OPR: i32 = 15;

// open flags
pub const O_RDONLY: i32 = 0;
pub const O_WRONLY: i32 = 1;
pub const O_CREAT: i32 = 0o100;
pub const O_TRUNC: i32 = 0o1000;

// object types of RodsObjStat_PI
pub const DATA_OBJ_T: i32 = 1;
pub const COLL_OBJ_T: i32 = 2;

// catalog columns used by the collection listing query
pub const COL_DATA_NAME: i32 = 403;
pub const COL_DATA_SIZE: i32 = 407;
pub const COL_COLL_NAME: i32 = 501;
pub const COL_COLL_PARENT_NAME: i32 = 502;
pub const MAX_SQL_ROWS: i32 = 256;

// keywords
pub const DEST_RESC_NAME_KW: &str = "destRescName";
pub const FORCE_FLAG_KW: &str = "forceFlag";
pub const RECURSIVE_OPR_KW: &str = "recursiveOpr";

// status codes
pub const SYS_UNMATCHED_API_NUM: i32 = -12000;
pub const SYS_INVALID_INPUT_PARAM: i32 = -130000;
pub const USER_FILE_DOES_NOT_EXIST: i32 = -310000;
pub const OVERWRITE_WITHOUT_FORCE_FLAG: i32 = -312000;
pub const CAT_NO_ROWS_FOUND: i32 = -808000;
pub const CAT_ALREADY_HAS_ITEM_BY_THAT_NAME: i32 = -809000;
pub const CAT_INSUFFICIENT_PRIVILEGE_LEVEL: i32 = -818000;
pub const CAT_INVALID_AUTHENTICATION: i32 = -826000;
pub const CAT_INVALID_USER: i32 = -827000;
pub const PAM_AUTH_PASSWORD_FAILED: i32 = -994000;

/// Base error code of a status that may carry an errno in its last three digits.
pub fn base_code(code: i32) -> i32 {
    code / 1000 * 1000
}
