//! Passive replies to inbound messages

use serde::Serialize;
use tracing::debug;

use crate::message::MessageHeader;

#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("failed to serialize reply")]
    Xml(#[from] quick_xml::SeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text {
        content: String,
    },
    Image {
        media_id: String,
    },
    Voice {
        media_id: String,
    },
    Video {
        media_id: String,
        title: String,
        description: String,
    },
    Music(Music),
    /// Articles are rendered in the given order
    News(Vec<Article>),
}

impl Reply {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// `MsgType` literal of the reply
    pub fn msg_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Voice { .. } => "voice",
            Self::Video { .. } => "video",
            Self::Music(_) => "music",
            Self::News(_) => "news",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Music {
    pub title: String,
    pub description: String,
    pub music_url: String,
    #[serde(rename = "HQMusicUrl")]
    pub hq_music_url: String,
    pub thumb_media_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Article {
    pub title: String,
    pub description: String,
    pub pic_url: String,
    pub url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Media<'a> {
    media_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct VideoMedia<'a> {
    media_id: &'a str,
    title: &'a str,
    description: &'a str,
}

#[derive(Serialize)]
struct Articles<'a> {
    item: &'a [Article],
}

#[derive(Serialize)]
#[serde(rename = "xml", rename_all = "PascalCase")]
struct WireReply<'a> {
    to_user_name: &'a str,
    from_user_name: &'a str,
    create_time: i64,
    msg_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<Media<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<Media<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video: Option<VideoMedia<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    music: Option<&'a Music>,
    #[serde(skip_serializing_if = "Option::is_none")]
    article_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    articles: Option<Articles<'a>>,
}

/// Serializes the reply to the message with the given header.
///
/// The reply is addressed back to the sender: sender and recipient of the header are swapped.
pub fn build(header: &MessageHeader, reply: &Reply) -> Result<Vec<u8>, ReplyError> {
    build_at(header, reply, chrono::Utc::now().timestamp())
}

fn build_at(
    header: &MessageHeader,
    reply: &Reply,
    create_time: i64,
) -> Result<Vec<u8>, ReplyError> {
    let mut wire = WireReply {
        to_user_name: &header.from_user_name,
        from_user_name: &header.to_user_name,
        create_time,
        msg_type: reply.msg_type(),
        content: None,
        image: None,
        voice: None,
        video: None,
        music: None,
        article_count: None,
        articles: None,
    };
    match reply {
        Reply::Text { content } => wire.content = Some(content),
        Reply::Image { media_id } => wire.image = Some(Media { media_id }),
        Reply::Voice { media_id } => wire.voice = Some(Media { media_id }),
        Reply::Video {
            media_id,
            title,
            description,
        } => {
            wire.video = Some(VideoMedia {
                media_id,
                title,
                description,
            })
        }
        Reply::Music(music) => wire.music = Some(music),
        Reply::News(articles) => {
            wire.article_count = Some(articles.len());
            wire.articles = Some(Articles { item: articles });
        }
    }

    let xml = quick_xml::se::to_string(&wire)?;
    debug!(msg_type = wire.msg_type, to = %header.from_user_name, %xml, "built reply");
    Ok(xml.into_bytes())
}
