use std::fmt;
use std::str::FromStr;

/// Known JID servers on WhatsApp.
pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
pub const GROUP_SERVER: &str = "g.us";
#[allow(dead_code)]
pub const LEGACY_USER_SERVER: &str = "c.us";
pub const BROADCAST_SERVER: &str = "broadcast";
pub const HIDDEN_USER_SERVER: &str = "lid";
pub const NEWSLETTER_SERVER: &str = "newsletter";
pub const HOSTED_USER_SERVER: &str = "hosted";
pub const HOSTED_LID_SERVER: &str = "hosted.lid";

/// The two parallel identity spaces a conversation can be addressed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressingMode {
    Pn,
    Lid,
}

impl fmt::Display for AddressingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pn => write!(f, "pn"),
            Self::Lid => write!(f, "lid"),
        }
    }
}

/// JID represents a WhatsApp user/entity ID (user@server or AD-JID).
///
/// JID (user/group/server identifier).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Jid {
    pub user: String,
    pub raw_agent: u8,
    pub device: u16,
    pub integrator: u16,
    pub server: String,
}

impl Jid {
    /// New regular JID (user@server).
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            raw_agent: 0,
            device: 0,
            integrator: 0,
            server: server.into(),
        }
    }

    /// New AD-JID (user.agent:device@server) for device-specific addressing.
    pub fn new_ad(
        user: impl Into<String>,
        agent: u8,
        device: u16,
        server: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            raw_agent: agent,
            device,
            integrator: 0,
            server: server.into(),
        }
    }

    /// Server JID (no user).
    pub fn server(server: impl Into<String>) -> Self {
        Self::new("", server)
    }

    /// Well-known JIDs.
    pub fn group_server() -> Self {
        Self::server(GROUP_SERVER)
    }
    pub fn default_server() -> Self {
        Self::server(DEFAULT_USER_SERVER)
    }
    pub fn broadcast_server() -> Self {
        Self::server(BROADCAST_SERVER)
    }
    pub fn status_broadcast() -> Self {
        Self::new("status", BROADCAST_SERVER)
    }

    /// User part as u64 (for normal user JIDs).
    pub fn user_int(&self) -> u64 {
        self.user.parse().unwrap_or(0)
    }

    /// JID without agent/device (regular user@server).
    pub fn to_non_ad(&self) -> Self {
        Self {
            user: self.user.clone(),
            raw_agent: 0,
            device: 0,
            integrator: self.integrator,
            server: self.server.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }

    pub fn is_broadcast_list(&self) -> bool {
        self.server == BROADCAST_SERVER && self.user != "status"
    }

    /// Status broadcast feed (`status@broadcast`).
    pub fn is_status_broadcast(&self) -> bool {
        self.server == BROADCAST_SERVER && self.user == "status"
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    pub fn is_newsletter(&self) -> bool {
        self.server == NEWSLETTER_SERVER
    }

    pub fn is_pn_user(&self) -> bool {
        self.server == DEFAULT_USER_SERVER
    }

    pub fn is_lid_user(&self) -> bool {
        self.server == HIDDEN_USER_SERVER
    }

    /// Whether this JID carries a device suffix (a "wire JID").
    pub fn has_device(&self) -> bool {
        self.device > 0
    }

    /// New JID with an explicit device, keeping user/server/agent/integrator.
    pub fn with_device(&self, device: u16) -> Self {
        Self {
            user: self.user.clone(),
            raw_agent: self.raw_agent,
            device,
            integrator: self.integrator,
            server: self.server.clone(),
        }
    }

    /// Two JIDs are the "same user" iff (user, server) match with devices stripped.
    pub fn same_user(&self, other: &Jid) -> bool {
        self.user == other.user && self.server == other.server
    }
}

impl FromStr for Jid {
    type Err = JidParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('@').collect();
        if parts.len() == 1 {
            return Ok(Self::server(parts[0]));
        }
        if parts.len() != 2 {
            return Err(JidParseError);
        }
        let mut jid = Self {
            user: parts[0].to_string(),
            raw_agent: 0,
            device: 0,
            integrator: 0,
            server: parts[1].to_string(),
        };
        if jid.user.contains('.') {
            let ud: Vec<&str> = jid.user.splitn(2, '.').collect();
            if ud.len() != 2 {
                return Err(JidParseError);
            }
            let u0 = ud[0].to_string();
            let rest = ud[1].to_string();
            jid.user = u0;
            let ad: Vec<&str> = rest.split(':').collect();
            jid.raw_agent = ad[0].parse().map_err(|_| JidParseError)?;
            if ad.len() == 2 {
                jid.device = ad[1].parse().map_err(|_| JidParseError)?;
            }
        } else if jid.user.contains(':') {
            let ud: Vec<&str> = jid.user.splitn(2, ':').collect();
            if ud.len() != 2 {
                return Err(JidParseError);
            }
            let u0 = ud[0].to_string();
            let u1 = ud[1].to_string();
            jid.user = u0;
            jid.device = u1.parse().map_err(|_| JidParseError)?;
        }
        Ok(jid)
    }
}

#[derive(Debug)]
pub struct JidParseError;

impl std::fmt::Display for JidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid JID format")
    }
}

impl std::error::Error for JidParseError {}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw_agent > 0 {
            write!(
                f,
                "{}.{}:{}@{}",
                self.user, self.raw_agent, self.device, self.server
            )
        } else if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else if !self.user.is_empty() {
            write!(f, "{}@{}", self.user, self.server)
        } else {
            write!(f, "{}", self.server)
        }
    }
}

impl serde::Serialize for Jid {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Jid {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Jid::from_str(&s).map_err(serde::de::Error::custom)
    }
}
