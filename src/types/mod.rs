mod jid;

pub use jid::{
    AddressingMode, Jid, BROADCAST_SERVER, DEFAULT_USER_SERVER, GROUP_SERVER,
    HIDDEN_USER_SERVER, HOSTED_LID_SERVER, HOSTED_USER_SERVER, NEWSLETTER_SERVER,
};

/// Message ID type (WhatsApp internal ID string).
pub type MessageId = String;

/// Server-assigned ID for newsletter messages.
pub type MessageServerId = i32;

/// Already-serialized application message payload (opaque protobuf bytes).
///
/// Building the full `proto.Message` schema is higher-level developer
/// ergonomics out of scope for this crate; the relay only needs the
/// encoded bytes plus enough shape metadata (`MessageType`, `MediaType`)
/// to route and label the stanza correctly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WireMessage(pub Vec<u8>);

impl WireMessage {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// `<message type=…>` attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Poll,
    Event,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Poll => "poll",
            Self::Event => "event",
        }
    }
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Text
    }
}

/// `<message edit=…>` attribute: in-place edit, pin-in-chat, or a delete
/// (own message vs. admin-deleting-someone-else's).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditType {
    Edit,
    Pin,
    DeleteOwn,
    DeleteAsAdmin,
}

impl EditType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Edit => "1",
            Self::Pin => "2",
            Self::DeleteOwn => "7",
            Self::DeleteAsAdmin => "8",
        }
    }
}

/// `<enc mediatype=…>` attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaType {
    Image,
    Video,
    Gif,
    Ptt,
    Audio,
    Vcard,
    Document,
    ContactArray,
    LiveLocation,
    Sticker,
    List,
    ListResponse,
    ButtonsResponse,
    Order,
    Product,
    NativeFlowResponse,
    Url,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Gif => "gif",
            Self::Ptt => "ptt",
            Self::Audio => "audio",
            Self::Vcard => "vcard",
            Self::Document => "document",
            Self::ContactArray => "contact_array",
            Self::LiveLocation => "livelocation",
            Self::Sticker => "sticker",
            Self::List => "list",
            Self::ListResponse => "list_response",
            Self::ButtonsResponse => "buttons_response",
            Self::Order => "order",
            Self::Product => "product",
            Self::NativeFlowResponse => "native_flow_response",
            Self::Url => "url",
        }
    }

    /// Whether this media type carries an interactive `<biz>` sub-node.
    pub fn is_interactive(&self) -> bool {
        matches!(
            self,
            Self::List | Self::ListResponse | Self::ButtonsResponse | Self::NativeFlowResponse
        )
    }
}
