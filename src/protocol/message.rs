//! Control structures exchanged during session setup.

use crate::error::Result;
use crate::net::pack::{PackReader, PackStruct, PackWriter};

/// Client startup (`StartupPack_PI`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupPack {
    /// Protocol id
    pub protocol: i32,
    /// Client asks for reconnect support (0 or 1)
    pub reconnect_flag: i32,
    /// Connect count (retries so far)
    pub connect_count: i32,
    /// Authenticating user
    pub proxy_user: String,
    /// Authenticating user's zone
    pub proxy_zone: String,
    /// User acted for
    pub client_user: String,
    /// Zone of the user acted for
    pub client_zone: String,
    /// Client release version
    pub release_version: String,
    /// Client API version
    pub api_version: String,
    /// Program hint plus optional `;request_server_negotiation`
    pub option: String,
}

impl StartupPack {
    /// Split the options string into tokens.
    pub fn option_tokens(&self) -> impl Iterator<Item = &str> {
        self.option.split(';').map(str::trim).filter(|t| !t.is_empty())
    }

    /// Check if the client asked for negotiation.
    pub fn requests_negotiation(&self) -> bool {
        self.option_tokens()
            .any(|token| token == super::REQUEST_SERVER_NEGOTIATION)
    }

    /// Check if the client asked for reconnect support.
    pub fn wants_reconnect(&self) -> bool {
        self.reconnect_flag != 0
    }
}

impl PackStruct for StartupPack {
    const NAME: &'static str = "StartupPack_PI";

    fn pack_fields(&self, writer: &mut PackWriter) {
        writer
            .int("irodsProt", self.protocol.into())
            .int("reconnFlag", self.reconnect_flag.into())
            .int("connectCnt", self.connect_count.into())
            .str("proxyUser", &self.proxy_user)
            .str("proxyRcatZone", &self.proxy_zone)
            .str("clientUser", &self.client_user)
            .str("clientRcatZone", &self.client_zone)
            .str("relVersion", &self.release_version)
            .str("apiVersion", &self.api_version)
            .str("option", &self.option);
    }

    fn unpack_fields(reader: &mut PackReader<'_>) -> Result<Self> {
        Ok(Self {
            protocol: reader.int32("irodsProt")?,
            reconnect_flag: reader.int32("reconnFlag")?,
            connect_count: reader.int32("connectCnt")?,
            proxy_user: reader.str("proxyUser")?,
            proxy_zone: reader.str("proxyRcatZone")?,
            client_user: reader.str("clientUser")?,
            client_zone: reader.str("clientRcatZone")?,
            release_version: reader.str("relVersion")?,
            api_version: reader.str("apiVersion")?,
            option: reader.str("option")?,
        })
    }
}

/// Agent version reply (`Version_PI`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Negative on rejection
    pub status: i32,
    /// Agent release version
    pub release_version: String,
    /// Agent API version
    pub api_version: String,
    /// Reconnect listener port, 0 when not offered
    pub reconnect_port: i32,
    /// Reconnect listener address, empty when not offered
    pub reconnect_addr: String,
    /// Session cookie for reconnects
    pub cookie: i32,
}

impl VersionInfo {
    /// Check if the agent offered reconnect.
    pub fn offers_reconnect(&self) -> bool {
        self.reconnect_port > 0 && !self.reconnect_addr.is_empty()
    }
}

impl PackStruct for VersionInfo {
    const NAME: &'static str = "Version_PI";

    fn pack_fields(&self, writer: &mut PackWriter) {
        writer
            .int("status", self.status.into())
            .str("relVersion", &self.release_version)
            .str("apiVersion", &self.api_version)
            .int("reconnPort", self.reconnect_port.into())
            .str("reconnAddr", &self.reconnect_addr)
            .int("cookie", self.cookie.into());
    }

    fn unpack_fields(reader: &mut PackReader<'_>) -> Result<Self> {
        Ok(Self {
            status: reader.int32("status")?,
            release_version: reader.str("relVersion")?,
            api_version: reader.str("apiVersion")?,
            reconnect_port: reader.int32("reconnPort")?,
            reconnect_addr: reader.str("reconnAddr")?,
            cookie: reader.int32("cookie")?,
        })
    }
}

/// Negotiation message (`CS_NEG_PI`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsNeg {
    /// 1 participates/succeeds, 0 declines/fails
    pub status: i32,
    /// `key=value;` text
    pub result: String,
}

impl PackStruct for CsNeg {
    const NAME: &'static str = "CS_NEG_PI";

    fn pack_fields(&self, writer: &mut PackWriter) {
        writer
            .int("status", self.status.into())
            .str("result", &self.result);
    }

    fn unpack_fields(reader: &mut PackReader<'_>) -> Result<Self> {
        Ok(Self {
            status: reader.int32("status")?,
            result: reader.str("result")?,
        })
    }
}

/// Reconnect control message (`ReconnMsg_PI`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnMsg {
    /// Status, negative on failure
    pub status: i32,
    /// Session cookie
    pub cookie: i32,
    /// Sender's processing state
    pub proc_state: i32,
    /// Reserved
    pub flag: i32,
}

impl PackStruct for ReconnMsg {
    const NAME: &'static str = "ReconnMsg_PI";

    fn pack_fields(&self, writer: &mut PackWriter) {
        writer
            .int("status", self.status.into())
            .int("cookie", self.cookie.into())
            .int("procState", self.proc_state.into())
            .int("flag", self.flag.into());
    }

    fn unpack_fields(reader: &mut PackReader<'_>) -> Result<Self> {
        Ok(Self {
            status: reader.int32("status")?,
            cookie: reader.int32("cookie")?,
            proc_state: reader.int32("procState")?,
            flag: reader.int32("flag")?,
        })
    }
}

/// One error entry (`RErrMsg_PI`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RErrMsg {
    /// Status code
    pub status: i32,
    /// Message text
    pub msg: String,
}

impl PackStruct for RErrMsg {
    const NAME: &'static str = "RErrMsg_PI";

    fn pack_fields(&self, writer: &mut PackWriter) {
        writer.int("status", self.status.into()).str("msg", &self.msg);
    }

    fn unpack_fields(reader: &mut PackReader<'_>) -> Result<Self> {
        Ok(Self {
            status: reader.int32("status")?,
            msg: reader.str("msg")?,
        })
    }
}

/// Error segment of a failed reply (`RError_PI`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RError {
    /// Entries, oldest first
    pub messages: Vec<RErrMsg>,
}

impl RError {
    /// Single-entry error.
    pub fn single(status: i32, msg: impl Into<String>) -> Self {
        Self {
            messages: vec![RErrMsg {
                status,
                msg: msg.into(),
            }],
        }
    }
}

impl PackStruct for RError {
    const NAME: &'static str = "RError_PI";

    fn pack_fields(&self, writer: &mut PackWriter) {
        writer.int("count", self.messages.len() as i64);
        for message in &self.messages {
            writer.nested(message);
        }
    }

    fn unpack_fields(reader: &mut PackReader<'_>) -> Result<Self> {
        let count = reader.int("count")?.clamp(0, crate::error::MAX_ERROR_MESSAGES as i64);
        let messages = (0..count)
            .map(|_| reader.nested::<RErrMsg>())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { messages })
    }
}

/// Limited password request (`getLimitedPasswordInp_PI`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitedPasswordInput {
    /// Lifetime in hours
    pub ttl: i32,
    /// Reserved
    pub unused: i32,
}

impl PackStruct for LimitedPasswordInput {
    const NAME: &'static str = "getLimitedPasswordInp_PI";

    fn pack_fields(&self, writer: &mut PackWriter) {
        writer
            .int("ttl", self.ttl.into())
            .int("unused1", self.unused.into());
    }

    fn unpack_fields(reader: &mut PackReader<'_>) -> Result<Self> {
        Ok(Self {
            ttl: reader.int32("ttl")?,
            unused: reader.int32("unused1")?,
        })
    }
}

/// Limited password reply (`getLimitedPasswordOut_PI`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitedPasswordOutput {
    /// Salt the client hashes with its password
    pub string_to_hash_with: String,
}

impl PackStruct for LimitedPasswordOutput {
    const NAME: &'static str = "getLimitedPasswordOut_PI";

    fn pack_fields(&self, writer: &mut PackWriter) {
        writer.str("stringToHashWith", &self.string_to_hash_with);
    }

    fn unpack_fields(reader: &mut PackReader<'_>) -> Result<Self> {
        Ok(Self {
            string_to_hash_with: reader.str("stringToHashWith")?,
        })
    }
}
