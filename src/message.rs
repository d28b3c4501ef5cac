//! Inbound messages and events pushed by the platform

use serde::Deserialize;
use serde::de::DeserializeOwned;

const EVENT_MSG_TYPE: &str = "event";
const QR_SCENE_PREFIX: &str = "qrscene_";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid message xml")]
    Xml(#[from] quick_xml::DeError),
    #[error("missing {0} element")]
    MissingField(&'static str),
    #[error("unknown message kind: {0}")]
    UnknownMessageKind(String),
}

/// Fields common to all inbound messages; used to address the reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeader {
    /// Official account receiving the message
    pub to_user_name: String,
    /// OpenID of the sending user
    pub from_user_name: String,
    /// Unix timestamp in seconds
    pub create_time: u64,
    pub msg_type: String,
    /// De-duplication key
    ///
    /// Events carry no id on the wire; for them it is the sender followed by the decimal create
    /// time.
    pub msg_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Image,
    Voice,
    Video,
    ShortVideo,
    Location,
    Link,
    Subscribe,
    Unsubscribe,
    Scan,
    LocationReport,
    MenuClick,
    MenuView,
}

impl MessageKind {
    fn classify(msg_type: &str, event: Option<&str>) -> Result<Self, ParseError> {
        let kind = match msg_type {
            "text" => Self::Text,
            "image" => Self::Image,
            "voice" => Self::Voice,
            "video" => Self::Video,
            "shortvideo" => Self::ShortVideo,
            "location" => Self::Location,
            "link" => Self::Link,
            EVENT_MSG_TYPE => match event.ok_or(ParseError::MissingField("Event"))? {
                "subscribe" => Self::Subscribe,
                "unsubscribe" => Self::Unsubscribe,
                "SCAN" => Self::Scan,
                "LOCATION" => Self::LocationReport,
                "CLICK" => Self::MenuClick,
                "VIEW" => Self::MenuView,
                other => return Err(ParseError::UnknownMessageKind(other.to_owned())),
            },
            other => return Err(ParseError::UnknownMessageKind(other.to_owned())),
        };
        Ok(kind)
    }

    pub fn is_event(self) -> bool {
        matches!(
            self,
            Self::Subscribe
                | Self::Unsubscribe
                | Self::Scan
                | Self::LocationReport
                | Self::MenuClick
                | Self::MenuView
        )
    }
}

/// Discriminators and header, decoded before the variant itself
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawHeader {
    to_user_name: String,
    from_user_name: String,
    create_time: u64,
    #[serde(default)]
    msg_type: Option<String>,
    #[serde(default, rename = "MsgId")]
    msg_id: Option<String>,
    #[serde(default)]
    event: Option<String>,
}

impl RawHeader {
    fn into_header(self, kind: MessageKind, msg_type: String) -> MessageHeader {
        let msg_id = match self.msg_id {
            Some(msg_id) if !kind.is_event() && !msg_id.is_empty() => msg_id,
            _ => format!("{}{}", self.from_user_name, self.create_time),
        };
        MessageHeader {
            to_user_name: self.to_user_name,
            from_user_name: self.from_user_name,
            create_time: self.create_time,
            msg_type,
            msg_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Text {
    #[serde(skip)]
    pub header: MessageHeader,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Image {
    #[serde(skip)]
    pub header: MessageHeader,
    pub pic_url: String,
    pub media_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Voice {
    #[serde(skip)]
    pub header: MessageHeader,
    pub media_id: String,
    pub format: String,
    /// Speech recognition result, if enabled for the account
    #[serde(default)]
    pub recognition: Option<String>,
}

/// Video and short video
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Video {
    #[serde(skip)]
    pub header: MessageHeader,
    pub media_id: String,
    pub thumb_media_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Location {
    #[serde(skip)]
    pub header: MessageHeader,
    #[serde(rename = "Location_X")]
    pub latitude: f64,
    #[serde(rename = "Location_Y")]
    pub longitude: f64,
    pub scale: u32,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Link {
    #[serde(skip)]
    pub header: MessageHeader,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
}

/// User followed the account
///
/// When following by scanning a parametrized QR code, `event_key` is the scene prefixed with
/// `qrscene_` and `ticket` is set.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Subscribe {
    #[serde(skip)]
    pub header: MessageHeader,
    #[serde(default)]
    pub event_key: Option<String>,
    #[serde(default)]
    pub ticket: Option<String>,
}

impl Subscribe {
    /// Scene value of the scanned QR code
    pub fn scene(&self) -> Option<&str> {
        self.event_key
            .as_deref()
            .and_then(|key| key.strip_prefix(QR_SCENE_PREFIX))
            .filter(|scene| !scene.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub header: MessageHeader,
}

/// A follower scanned a parametrized QR code
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Scan {
    #[serde(skip)]
    pub header: MessageHeader,
    /// Scene of the QR code
    pub event_key: String,
    #[serde(default)]
    pub ticket: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocationReport {
    #[serde(skip)]
    pub header: MessageHeader,
    pub latitude: f64,
    pub longitude: f64,
    pub precision: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MenuClick {
    #[serde(skip)]
    pub header: MessageHeader,
    /// Key of the clicked menu button
    pub event_key: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MenuView {
    #[serde(skip)]
    pub header: MessageHeader,
    /// Target url of the menu button
    pub event_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(Text),
    Image(Image),
    Voice(Voice),
    Video(Video),
    ShortVideo(Video),
    Location(Location),
    Link(Link),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    Scan(Scan),
    LocationReport(LocationReport),
    MenuClick(MenuClick),
    MenuView(MenuView),
}

impl Message {
    pub fn header(&self) -> &MessageHeader {
        match self {
            Self::Text(m) => &m.header,
            Self::Image(m) => &m.header,
            Self::Voice(m) => &m.header,
            Self::Video(m) | Self::ShortVideo(m) => &m.header,
            Self::Location(m) => &m.header,
            Self::Link(m) => &m.header,
            Self::Subscribe(m) => &m.header,
            Self::Unsubscribe(m) => &m.header,
            Self::Scan(m) => &m.header,
            Self::LocationReport(m) => &m.header,
            Self::MenuClick(m) => &m.header,
            Self::MenuView(m) => &m.header,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text(_) => MessageKind::Text,
            Self::Image(_) => MessageKind::Image,
            Self::Voice(_) => MessageKind::Voice,
            Self::Video(_) => MessageKind::Video,
            Self::ShortVideo(_) => MessageKind::ShortVideo,
            Self::Location(_) => MessageKind::Location,
            Self::Link(_) => MessageKind::Link,
            Self::Subscribe(_) => MessageKind::Subscribe,
            Self::Unsubscribe(_) => MessageKind::Unsubscribe,
            Self::Scan(_) => MessageKind::Scan,
            Self::LocationReport(_) => MessageKind::LocationReport,
            Self::MenuClick(_) => MessageKind::MenuClick,
            Self::MenuView(_) => MessageKind::MenuView,
        }
    }

    fn decode(kind: MessageKind, xml: &str, header: MessageHeader) -> Result<Self, ParseError> {
        let message = match kind {
            MessageKind::Text => Self::Text(Text {
                header,
                ..from_str::<Text>(xml)?
            }),
            MessageKind::Image => Self::Image(Image {
                header,
                ..from_str::<Image>(xml)?
            }),
            MessageKind::Voice => Self::Voice(Voice {
                header,
                ..from_str::<Voice>(xml)?
            }),
            MessageKind::Video => Self::Video(Video {
                header,
                ..from_str::<Video>(xml)?
            }),
            MessageKind::ShortVideo => Self::ShortVideo(Video {
                header,
                ..from_str::<Video>(xml)?
            }),
            MessageKind::Location => Self::Location(Location {
                header,
                ..from_str::<Location>(xml)?
            }),
            MessageKind::Link => Self::Link(Link {
                header,
                ..from_str::<Link>(xml)?
            }),
            MessageKind::Subscribe => Self::Subscribe(Subscribe {
                header,
                ..from_str::<Subscribe>(xml)?
            }),
            MessageKind::Unsubscribe => Self::Unsubscribe(Unsubscribe { header }),
            MessageKind::Scan => Self::Scan(Scan {
                header,
                ..from_str::<Scan>(xml)?
            }),
            MessageKind::LocationReport => Self::LocationReport(LocationReport {
                header,
                ..from_str::<LocationReport>(xml)?
            }),
            MessageKind::MenuClick => Self::MenuClick(MenuClick {
                header,
                ..from_str::<MenuClick>(xml)?
            }),
            MessageKind::MenuView => Self::MenuView(MenuView {
                header,
                ..from_str::<MenuView>(xml)?
            }),
        };
        Ok(message)
    }
}

fn from_str<T: DeserializeOwned>(xml: &str) -> Result<T, ParseError> {
    Ok(quick_xml::de::from_str(xml)?)
}

/// Decodes the plaintext message XML.
///
/// The kind is classified from `MsgType` (and `Event` for events) first, then the XML is decoded
/// into the matching variant.
pub fn parse(xml: &[u8]) -> Result<(MessageHeader, Message), ParseError> {
    let xml = std::str::from_utf8(xml)?;
    let mut raw: RawHeader = from_str(xml)?;

    let msg_type = raw.msg_type.take().ok_or(ParseError::MissingField("MsgType"))?;
    let kind = MessageKind::classify(&msg_type, raw.event.as_deref())?;
    let header = raw.into_header(kind, msg_type);

    let message = Message::decode(kind, xml, header.clone())?;
    Ok((header, message))
}
