//! Typed views of the packing instructions exchanged with the server.
//!
//! Each message converts to a [`Tag`] with `to_tag` and back with `from_tag`. Clients build
//! requests and parse replies; the mock grid in `testutils` does the opposite.

use common::error::{Error, Result};

use super::Tag;
use super::api;

fn reconnect_flag(value: bool) -> i32 {
    if value { api::RECONNECT_FLAG } else { 0 }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartupPack {
    pub proxy_user: String,
    pub proxy_zone: String,
    pub client_user: String,
    pub client_zone: String,
    pub reconnect: bool,
    pub option: String,
}

impl StartupPack {
    pub fn to_tag(&self) -> Tag {
        Tag::new("StartupPack_PI")
            .with_leaf("irodsProt", api::XML_PROTOCOL)
            .with_leaf("reconnFlag", reconnect_flag(self.reconnect))
            .with_leaf("connectCnt", 0)
            .with_leaf("proxyUser", &self.proxy_user)
            .with_leaf("proxyRcatZone", &self.proxy_zone)
            .with_leaf("clientUser", &self.client_user)
            .with_leaf("clientRcatZone", &self.client_zone)
            .with_leaf("relVersion", api::RELEASE_VERSION)
            .with_leaf("apiVersion", api::API_VERSION)
            .with_leaf("option", &self.option)
    }

    pub fn from_tag(tag: &Tag) -> Result<Self> {
        expect_name(tag, "StartupPack_PI")?;
        Ok(Self {
            proxy_user: tag.str_field("proxyUser")?.to_string(),
            proxy_zone: tag.str_field("proxyRcatZone")?.to_string(),
            client_user: tag.str_field("clientUser")?.to_string(),
            client_zone: tag.str_field("clientRcatZone")?.to_string(),
            reconnect: tag.int_field("reconnFlag")? == api::RECONNECT_FLAG,
            option: tag.str_field("option")?.to_string(),
        })
    }
}

/// Server reply to the startup pack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartupResponse {
    pub status: i32,
    pub release_version: String,
    pub api_version: String,
    pub reconnect_port: i32,
    pub reconnect_address: String,
    pub cookie: i32,
}

impl StartupResponse {
    pub fn to_tag(&self) -> Tag {
        Tag::new("Version_PI")
            .with_leaf("status", self.status)
            .with_leaf("relVersion", &self.release_version)
            .with_leaf("apiVersion", &self.api_version)
            .with_leaf("reconnPort", self.reconnect_port)
            .with_leaf("reconnAddr", &self.reconnect_address)
            .with_leaf("cookie", self.cookie)
    }

    pub fn from_tag(tag: &Tag) -> Result<Self> {
        expect_name(tag, "Version_PI")?;
        Ok(Self {
            status: tag.int_field("status")?,
            release_version: tag.str_field("relVersion")?.to_string(),
            api_version: tag.str_field("apiVersion")?.to_string(),
            reconnect_port: tag.int_field("reconnPort")?,
            reconnect_address: tag.str_field("reconnAddr")?.to_string(),
            cookie: tag.int_field("cookie")?,
        })
    }
}

/// Ordered keyword/value options (`KeyValPair_PI`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyValPair(pub Vec<(String, String)>);

impl KeyValPair {
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.push((key.to_string(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn to_tag(&self) -> Tag {
        let mut tag = Tag::new("KeyValPair_PI").with_leaf("ssLen", self.0.len());
        for (key, _) in &self.0 {
            tag.push(Tag::leaf("keyWord", key));
        }
        for (_, value) in &self.0 {
            tag.push(Tag::leaf("svalue", value));
        }
        tag
    }

    pub fn from_tag(tag: &Tag) -> Result<Self> {
        expect_name(tag, "KeyValPair_PI")?;
        let keys: Vec<_> = tag.children_named("keyWord").filter_map(Tag::text).collect();
        let values: Vec<_> = tag.children_named("svalue").filter_map(Tag::text).collect();
        let len = tag.int_field("ssLen")?;
        if keys.len() != values.len() || keys.len() != len.max(0) as usize {
            return Err(Error::protocol(format!(
                "KeyValPair_PI length mismatch: ssLen={len}, {} keys, {} values",
                keys.len(),
                values.len()
            )));
        }
        Ok(Self(
            keys.into_iter()
                .zip(values)
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ))
    }
}

/// Data object operation input (`DataObjInp_PI`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataObjInp {
    pub path: String,
    pub create_mode: i32,
    pub open_flags: i32,
    pub offset: i64,
    pub data_size: i64,
    pub num_threads: i32,
    pub opr_type: i32,
    pub options: KeyValPair,
}

impl DataObjInp {
    pub fn new(path: impl Into<String>, opr_type: i32) -> Self {
        Self {
            path: path.into(),
            opr_type,
            ..Default::default()
        }
    }

    pub fn to_tag(&self) -> Tag {
        Tag::new("DataObjInp_PI")
            .with_leaf("objPath", &self.path)
            .with_leaf("createMode", self.create_mode)
            .with_leaf("openFlags", self.open_flags)
            .with_leaf("offset", self.offset)
            .with_leaf("dataSize", self.data_size)
            .with_leaf("numThreads", self.num_threads)
            .with_leaf("oprType", self.opr_type)
            .with(self.options.to_tag())
    }

    pub fn from_tag(tag: &Tag) -> Result<Self> {
        expect_name(tag, "DataObjInp_PI")?;
        Ok(Self {
            path: tag.str_field("objPath")?.to_string(),
            create_mode: tag.int_field("createMode")?,
            open_flags: tag.int_field("openFlags")?,
            offset: tag.long_field("offset")?,
            data_size: tag.long_field("dataSize")?,
            num_threads: tag.int_field("numThreads")?,
            opr_type: tag.int_field("oprType")?,
            options: KeyValPair::from_tag(tag.required("KeyValPair_PI")?)?,
        })
    }
}

/// Rename input (`DataObjCopyInp_PI`): source and destination instructions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataObjCopyInp {
    pub source: DataObjInp,
    pub destination: DataObjInp,
}

impl DataObjCopyInp {
    pub fn rename(source: &str, destination: &str, opr_type: i32) -> Self {
        Self {
            source: DataObjInp::new(source, opr_type),
            destination: DataObjInp::new(destination, opr_type),
        }
    }

    pub fn to_tag(&self) -> Tag {
        Tag::new("DataObjCopyInp_PI")
            .with(self.source.to_tag())
            .with(self.destination.to_tag())
    }

    pub fn from_tag(tag: &Tag) -> Result<Self> {
        expect_name(tag, "DataObjCopyInp_PI")?;
        let mut inputs = tag.children_named("DataObjInp_PI");
        let (Some(source), Some(destination)) = (inputs.next(), inputs.next()) else {
            return Err(Error::protocol("DataObjCopyInp_PI needs two DataObjInp_PI entries"));
        };
        Ok(Self {
            source: DataObjInp::from_tag(source)?,
            destination: DataObjInp::from_tag(destination)?,
        })
    }
}

/// Collection create input (`CollInpNew_PI`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollInp {
    pub name: String,
    pub flags: i32,
    pub opr_type: i32,
    pub options: KeyValPair,
}

impl CollInp {
    pub fn to_tag(&self) -> Tag {
        Tag::new("CollInpNew_PI")
            .with_leaf("collName", &self.name)
            .with_leaf("flags", self.flags)
            .with_leaf("oprType", self.opr_type)
            .with(self.options.to_tag())
    }

    pub fn from_tag(tag: &Tag) -> Result<Self> {
        expect_name(tag, "CollInpNew_PI")?;
        Ok(Self {
            name: tag.str_field("collName")?.to_string(),
            flags: tag.int_field("flags")?,
            opr_type: tag.int_field("oprType")?,
            options: KeyValPair::from_tag(tag.required("KeyValPair_PI")?)?,
        })
    }
}

/// Reply to a put/get telling the client where to open parallel streams (`PortalOprOut_PI`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortalOprOut {
    pub status: i32,
    pub l1desc_inx: i32,
    pub num_threads: i32,
    pub port: i32,
    pub cookie: i32,
    pub window_size: i32,
    pub host: String,
}

impl PortalOprOut {
    pub fn to_tag(&self) -> Tag {
        Tag::new("PortalOprOut_PI")
            .with_leaf("status", self.status)
            .with_leaf("l1descInx", self.l1desc_inx)
            .with_leaf("numThreads", self.num_threads)
            .with_leaf("chksum", "")
            .with(
                Tag::new("PortList_PI")
                    .with_leaf("portNum", self.port)
                    .with_leaf("cookie", self.cookie)
                    .with_leaf("sock", 0)
                    .with_leaf("windowSize", self.window_size)
                    .with_leaf("hostAddr", &self.host),
            )
    }

    pub fn from_tag(tag: &Tag) -> Result<Self> {
        expect_name(tag, "PortalOprOut_PI")?;
        let mut portal = Self {
            status: tag.int_field("status")?,
            l1desc_inx: tag.int_field("l1descInx")?,
            num_threads: tag.int_field("numThreads")?,
            ..Default::default()
        };
        if let Some(ports) = tag.child("PortList_PI") {
            portal.port = ports.int_field("portNum")?;
            portal.cookie = ports.int_field("cookie")?;
            portal.window_size = ports.int_field("windowSize")?;
            portal.host = ports.str_field("hostAddr")?.to_string();
        }
        Ok(portal)
    }
}

/// Object stat reply (`RodsObjStat_PI`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RodsObjStat {
    pub size: i64,
    pub obj_type: i32,
    pub owner_name: String,
    pub owner_zone: String,
    pub modify_time: String,
}

impl RodsObjStat {
    pub fn to_tag(&self) -> Tag {
        Tag::new("RodsObjStat_PI")
            .with_leaf("objSize", self.size)
            .with_leaf("objType", self.obj_type)
            .with_leaf("dataMode", 0)
            .with_leaf("dataId", "")
            .with_leaf("chksum", "")
            .with_leaf("ownerName", &self.owner_name)
            .with_leaf("ownerZone", &self.owner_zone)
            .with_leaf("createTime", &self.modify_time)
            .with_leaf("modifyTime", &self.modify_time)
    }

    pub fn from_tag(tag: &Tag) -> Result<Self> {
        expect_name(tag, "RodsObjStat_PI")?;
        Ok(Self {
            size: tag.long_field("objSize")?,
            obj_type: tag.int_field("objType")?,
            owner_name: tag.str_field("ownerName")?.to_string(),
            owner_zone: tag.str_field("ownerZone")?.to_string(),
            modify_time: tag.str_field("modifyTime")?.to_string(),
        })
    }
}

pub fn int_pi(value: i32) -> Tag {
    Tag::new("INT_PI").with_leaf("myInt", value)
}

pub fn parse_int_pi(tag: &Tag) -> Result<i32> {
    expect_name(tag, "INT_PI")?;
    tag.int_field("myInt")
}

/// Catalog query input (`GenQueryInp_PI`) restricted to selects and equality-style conditions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GenQueryInp {
    pub max_rows: i32,
    pub continue_inx: i32,
    pub select: Vec<i32>,
    pub conditions: Vec<(i32, String)>,
}

impl GenQueryInp {
    pub fn to_tag(&self) -> Tag {
        let mut selects = Tag::new("InxIvalPair_PI").with_leaf("iiLen", self.select.len());
        for column in &self.select {
            selects.push(Tag::leaf("inx", column));
        }
        for _ in &self.select {
            selects.push(Tag::leaf("ivalue", 1));
        }
        let mut conditions = Tag::new("InxValPair_PI").with_leaf("isLen", self.conditions.len());
        for (column, _) in &self.conditions {
            conditions.push(Tag::leaf("inx", column));
        }
        for (_, condition) in &self.conditions {
            conditions.push(Tag::leaf("svalue", condition));
        }
        Tag::new("GenQueryInp_PI")
            .with_leaf("maxRows", self.max_rows)
            .with_leaf("continueInx", self.continue_inx)
            .with_leaf("partialStartIndex", 0)
            .with_leaf("options", 0)
            .with(KeyValPair::default().to_tag())
            .with(selects)
            .with(conditions)
    }

    pub fn from_tag(tag: &Tag) -> Result<Self> {
        expect_name(tag, "GenQueryInp_PI")?;
        let parse_ints = |parent: &Tag, name: &str| -> Result<Vec<i32>> {
            parent
                .children_named(name)
                .map(|child| {
                    child
                        .text()
                        .and_then(|text| text.trim().parse().ok())
                        .ok_or_else(|| Error::protocol(format!("invalid {name} in GenQueryInp_PI")))
                })
                .collect()
        };
        let selects = tag.required("InxIvalPair_PI")?;
        let conditions = tag.required("InxValPair_PI")?;
        let condition_columns = parse_ints(conditions, "inx")?;
        let condition_values: Vec<_> = conditions
            .children_named("svalue")
            .filter_map(Tag::text)
            .map(str::to_string)
            .collect();
        if condition_columns.len() != condition_values.len() {
            return Err(Error::protocol("InxValPair_PI length mismatch"));
        }
        Ok(Self {
            max_rows: tag.int_field("maxRows")?,
            continue_inx: tag.int_field("continueInx")?,
            select: parse_ints(selects, "inx")?,
            conditions: condition_columns.into_iter().zip(condition_values).collect(),
        })
    }
}

/// Catalog query reply (`GenQueryOut_PI`), stored column-wise.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GenQueryOut {
    pub row_count: usize,
    pub continue_inx: i32,
    pub columns: Vec<(i32, Vec<String>)>,
}

impl GenQueryOut {
    pub fn column(&self, attribute: i32) -> Option<&[String]> {
        self.columns
            .iter()
            .find(|(inx, _)| *inx == attribute)
            .map(|(_, values)| values.as_slice())
    }

    pub fn to_tag(&self) -> Tag {
        let mut tag = Tag::new("GenQueryOut_PI")
            .with_leaf("rowCnt", self.row_count)
            .with_leaf("attriCnt", self.columns.len())
            .with_leaf("continueInx", self.continue_inx)
            .with_leaf("totalRowCount", 0);
        for (attribute, values) in &self.columns {
            let reslen = values.iter().map(|v| v.len() + 1).max().unwrap_or(1);
            let mut result = Tag::new("SqlResult_PI")
                .with_leaf("attriInx", attribute)
                .with_leaf("reslen", reslen);
            for value in values {
                result.push(Tag::leaf("value", value));
            }
            tag.push(result);
        }
        tag
    }

    pub fn from_tag(tag: &Tag) -> Result<Self> {
        expect_name(tag, "GenQueryOut_PI")?;
        let row_count = usize::try_from(tag.int_field("rowCnt")?)
            .map_err(|_| Error::protocol("negative rowCnt in GenQueryOut_PI"))?;
        let mut columns = Vec::new();
        for result in tag.children_named("SqlResult_PI") {
            let values: Vec<String> = result
                .children_named("value")
                .map(|value| value.text().unwrap_or_default().to_string())
                .collect();
            if values.len() != row_count {
                return Err(Error::protocol(format!(
                    "SqlResult_PI has {} values, expected {row_count}",
                    values.len()
                )));
            }
            columns.push((result.int_field("attriInx")?, values));
        }
        Ok(Self {
            row_count,
            continue_inx: tag.int_field("continueInx")?,
            columns,
        })
    }
}

pub fn auth_request_out(challenge: &str) -> Tag {
    Tag::new("authRequestOut_PI").with_leaf("challenge", challenge)
}

pub fn parse_auth_request_out(tag: &Tag) -> Result<String> {
    expect_name(tag, "authRequestOut_PI")?;
    Ok(tag.str_field("challenge")?.to_string())
}

pub fn auth_response_inp(response: &str, username: &str) -> Tag {
    Tag::new("authResponseInp_PI")
        .with_leaf("response", response)
        .with_leaf("username", username)
}

/// Returns `(response, username)`.
pub fn parse_auth_response_inp(tag: &Tag) -> Result<(String, String)> {
    expect_name(tag, "authResponseInp_PI")?;
    Ok((
        tag.str_field("response")?.to_string(),
        tag.str_field("username")?.to_string(),
    ))
}

pub fn pam_auth_request_inp(user: &str, password: &str, time_to_live: i32) -> Tag {
    Tag::new("pamAuthRequestInp_PI")
        .with_leaf("pamUser", user)
        .with_leaf("pamPassword", password)
        .with_leaf("timeToLive", time_to_live)
}

/// Returns `(user, password, time_to_live)`.
pub fn parse_pam_auth_request_inp(tag: &Tag) -> Result<(String, String, i32)> {
    expect_name(tag, "pamAuthRequestInp_PI")?;
    Ok((
        tag.str_field("pamUser")?.to_string(),
        tag.str_field("pamPassword")?.to_string(),
        tag.int_field("timeToLive")?,
    ))
}

pub fn pam_auth_request_out(password: &str) -> Tag {
    Tag::new("pamAuthRequestOut_PI").with_leaf("irodsPamPassword", password)
}

pub fn parse_pam_auth_request_out(tag: &Tag) -> Result<String> {
    expect_name(tag, "pamAuthRequestOut_PI")?;
    Ok(tag.str_field("irodsPamPassword")?.to_string())
}

/// Error stack attached to a failed reply (`RError_PI`).
pub fn rerror(messages: &[(i32, String)]) -> Tag {
    let mut tag = Tag::new("RError_PI").with_leaf("count", messages.len());
    for (status, message) in messages {
        tag.push(
            Tag::new("RErrMsg_PI")
                .with_leaf("status", status)
                .with_leaf("msg", message),
        );
    }
    tag
}

/// Messages of an error stack joined into one line.
pub fn parse_rerror(tag: &Tag) -> Result<String> {
    expect_name(tag, "RError_PI")?;
    let messages: Vec<String> = tag
        .children_named("RErrMsg_PI")
        .map(|entry| entry.str_field("msg").map(|msg| msg.trim().to_string()))
        .collect::<Result<_>>()?;
    Ok(messages.join("; "))
}

fn expect_name(tag: &Tag, name: &str) -> Result<()> {
    if tag.name() != name {
        return Err(Error::protocol(format!(
            "expected {name}, received {}",
            tag.name()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_obj_inp_carries_keywords() -> Result<()> {
        let mut input = DataObjInp::new("/tempZone/home/rods/a.dat", api::PUT_OPR);
        input.data_size = 1 << 20;
        input.num_threads = 4;
        input.options.insert(api::DEST_RESC_NAME_KW, "demoResc");
        input.options.insert(api::FORCE_FLAG_KW, "");
        let parsed = DataObjInp::from_tag(&Tag::parse(&input.to_tag().to_wire())?)?;
        assert_eq!(parsed, input);
        assert_eq!(parsed.options.get(api::DEST_RESC_NAME_KW), Some("demoResc"));
        assert_eq!(parsed.options.get("missing"), None);
        Ok(())
    }

    #[test]
    fn portal_without_port_list() -> Result<()> {
        let tag = Tag::new("PortalOprOut_PI")
            .with_leaf("status", 0)
            .with_leaf("l1descInx", 3)
            .with_leaf("numThreads", 0)
            .with_leaf("chksum", "");
        let portal = PortalOprOut::from_tag(&tag)?;
        assert_eq!(portal.num_threads, 0);
        assert_eq!(portal.port, 0);
        assert!(portal.host.is_empty());
        Ok(())
    }

    #[test]
    fn query_reply_is_column_wise() -> Result<()> {
        let out = GenQueryOut {
            row_count: 2,
            continue_inx: 0,
            columns: vec![
                (api::COL_DATA_NAME, vec!["a.txt".into(), "b.txt".into()]),
                (api::COL_DATA_SIZE, vec!["1".into(), "22".into()]),
            ],
        };
        let parsed = GenQueryOut::from_tag(&Tag::parse(&out.to_tag().to_wire())?)?;
        assert_eq!(parsed, out);
        assert_eq!(
            parsed.column(api::COL_DATA_SIZE),
            Some(&["1".to_string(), "22".to_string()][..])
        );
        Ok(())
    }

    #[test]
    fn query_reply_with_short_column_is_rejected() {
        let tag = Tag::new("GenQueryOut_PI")
            .with_leaf("rowCnt", 2)
            .with_leaf("attriCnt", 1)
            .with_leaf("continueInx", 0)
            .with_leaf("totalRowCount", 0)
            .with(
                Tag::new("SqlResult_PI")
                    .with_leaf("attriInx", api::COL_DATA_NAME)
                    .with_leaf("reslen", 6)
                    .with_leaf("value", "a.txt"),
            );
        assert!(matches!(GenQueryOut::from_tag(&tag), Err(Error::Protocol(_))));
    }

    #[test]
    fn error_stack_is_joined() -> Result<()> {
        let tag = rerror(&[
            (api::CAT_NO_ROWS_FOUND, "no rows".to_string()),
            (api::CAT_NO_ROWS_FOUND, " second ".to_string()),
        ]);
        assert_eq!(parse_rerror(&tag)?, "no rows; second");
        Ok(())
    }

    #[test]
    fn wrong_message_name_is_protocol_error() {
        let tag = int_pi(1);
        assert!(matches!(
            StartupResponse::from_tag(&tag),
            Err(Error::Protocol(_))
        ));
        assert_eq!(parse_int_pi(&tag).ok(), Some(1));
    }
}
