//! Post content codec.
//!
//! Stored post content is sanitized HTML in which every attachment image
//! carries an `attachment-instanceid` marker instead of a source. The codec
//! turns submitted editable content into that stored form (extracting
//! embedded `data:` images into pending files) and turns the stored form
//! back into renderable HTML by resolving markers to static URLs.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::errors::{AppError, AppResult};
use crate::models::post::PostAttachment;
use crate::storage::attachment_url;

static IMG_TAG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<img\b[^>]*>").expect("img regex must compile"));

static INSTANCE_ATTR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\s+attachment-instanceid\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>/]+))"#)
        .expect("instance attr regex must compile")
});

static SRC_ATTR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\s+src\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>/]+))"#)
        .expect("src attr regex must compile")
});

static DATA_URI_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^data:([a-zA-Z0-9.+-]+/[a-zA-Z0-9.+-]+);base64,(.+)$")
        .expect("data uri regex must compile")
});

static SANITIZER: Lazy<ammonia::Builder<'static>> = Lazy::new(|| {
    let mut builder = ammonia::Builder::default();
    builder
        .add_tag_attributes("img", &["attachment-instanceid"])
        .add_generic_attributes(&["style", "class"])
        .link_rel(Some("noopener noreferrer"));
    builder
});

/// An embedded image decoded out of submitted content, waiting to be
/// validated and written to the attachment store.
#[derive(Debug, Clone)]
pub struct PendingImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct SerializedContent {
    /// Sanitized HTML where every attachment image bears a definitive
    /// instance-id marker and no ephemeral source remains.
    pub content: String,
    /// New images in document order; index i was assigned marker
    /// `current_count + i`.
    pub new_images: Vec<PendingImage>,
    /// Instance ids of images that were already tagged.
    pub referenced: Vec<i64>,
}

/// Prepare submitted editable content for storage.
///
/// Already-tagged images are recorded as referenced and kept as they are.
/// Images with a `data:` source are decoded into [`PendingImage`]s, their
/// source stripped, and assigned the next instance ids starting at
/// `current_count`. Other images (foreign sources, unparseable markers)
/// pass through untouched.
pub fn serialize_content(raw: &str, current_count: i64) -> AppResult<SerializedContent> {
    let mut new_images: Vec<PendingImage> = Vec::new();
    let mut referenced: Vec<i64> = Vec::new();
    let mut out = String::with_capacity(raw.len());
    let mut last = 0usize;

    for found in IMG_TAG_REGEX.find_iter(raw) {
        out.push_str(&raw[last..found.start()]);
        let tag = found.as_str();

        if let Some(instance_id) = marker_value(tag) {
            if !referenced.contains(&instance_id) {
                referenced.push(instance_id);
            }
            out.push_str(tag);
        } else if let Some((mime_type, data)) = data_uri_source(tag)? {
            let instance_id = current_count + new_images.len() as i64;
            new_images.push(PendingImage { mime_type, data });

            let stripped = SRC_ATTR_REGEX.replace(tag, "");
            let stripped = INSTANCE_ATTR_REGEX.replace(&stripped, "");
            out.push_str(&insert_attr(
                &stripped,
                &format!("attachment-instanceid=\"{instance_id}\""),
            ));
        } else {
            out.push_str(tag);
        }

        last = found.end();
    }
    out.push_str(&raw[last..]);

    Ok(SerializedContent {
        content: sanitize(&out),
        new_images,
        referenced,
    })
}

/// Resolve stored content into renderable HTML. Markers without a matching
/// attachment (or with a non-numeric value) are left alone; the image simply
/// has no source.
pub fn render_content(content: &str, attachments: &[PostAttachment]) -> String {
    let mut out = String::with_capacity(content.len());
    let mut last = 0usize;

    for found in IMG_TAG_REGEX.find_iter(content) {
        out.push_str(&content[last..found.start()]);
        let tag = found.as_str();

        let resolved = marker_value(tag).and_then(|instance_id| {
            attachments
                .iter()
                .find(|attachment| attachment.instance_id == instance_id)
        });

        match resolved {
            Some(attachment) => {
                let url = attachment_url(attachment.file_id, &attachment.mime_type);
                let stripped = SRC_ATTR_REGEX.replace(tag, "");
                out.push_str(&insert_attr(&stripped, &format!("src=\"{url}\"")));
            }
            None => out.push_str(tag),
        }

        last = found.end();
    }
    out.push_str(&content[last..]);

    out
}

pub fn sanitize(html: &str) -> String {
    SANITIZER.clean(html).to_string()
}

fn marker_value(tag: &str) -> Option<i64> {
    let caps = INSTANCE_ATTR_REGEX.captures(tag)?;
    attr_value(&caps).parse::<i64>().ok()
}

fn data_uri_source(tag: &str) -> AppResult<Option<(String, Vec<u8>)>> {
    let Some(caps) = SRC_ATTR_REGEX.captures(tag) else {
        return Ok(None);
    };
    let src = attr_value(&caps);
    let Some(uri) = DATA_URI_REGEX.captures(src) else {
        return Ok(None);
    };

    let mime_type = uri[1].to_string();
    let payload: String = uri[2].chars().filter(|c| !c.is_whitespace()).collect();
    let data = BASE64
        .decode(payload)
        .map_err(|_| AppError::validation("content", "embedded image is not valid base64"))?;

    Ok(Some((mime_type, data)))
}

fn attr_value<'t>(caps: &'t Captures) -> &'t str {
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_str())
        .unwrap_or("")
}

fn insert_attr(tag: &str, attr: &str) -> String {
    if let Some(head) = tag.strip_suffix("/>") {
        format!("{} {attr}/>", head.trim_end())
    } else if let Some(head) = tag.strip_suffix('>') {
        format!("{} {attr}>", head.trim_end())
    } else {
        format!("{tag} {attr}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn data_uri(mime: &str, data: &[u8]) -> String {
        format!("data:{};base64,{}", mime, BASE64.encode(data))
    }

    fn attachment(instance_id: i64, mime: &str) -> PostAttachment {
        PostAttachment {
            file_id: Uuid::new_v4(),
            mime_type: mime.to_string(),
            instance_id,
            post_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn embedded_images_become_pending_files_with_sequential_markers() {
        let html = format!(
            r#"<p>hello</p><img src="{}"><img src="{}">"#,
            data_uri("image/png", b"first"),
            data_uri("image/gif", b"second"),
        );

        let serialized = serialize_content(&html, 5).expect("serialize");

        assert_eq!(serialized.new_images.len(), 2);
        assert_eq!(serialized.new_images[0].mime_type, "image/png");
        assert_eq!(serialized.new_images[0].data, b"first");
        assert!(serialized.content.contains(r#"attachment-instanceid="5""#));
        assert!(serialized.content.contains(r#"attachment-instanceid="6""#));
        assert!(!serialized.content.contains("data:"));
    }

    #[test]
    fn tagged_images_are_collected_as_referenced() {
        let html = r#"<img attachment-instanceid="0"><img attachment-instanceid="3"><img attachment-instanceid="0">"#;

        let serialized = serialize_content(html, 4).expect("serialize");

        assert_eq!(serialized.referenced, vec![0, 3]);
        assert!(serialized.new_images.is_empty());
    }

    #[test]
    fn non_numeric_marker_is_skipped_not_fatal() {
        let html = r#"<img attachment-instanceid="banana"><img src="https://example.com/pic.png">"#;

        let serialized = serialize_content(html, 0).expect("serialize");
        assert!(serialized.referenced.is_empty());
        assert!(serialized.new_images.is_empty());

        let rendered = render_content(html, &[attachment(0, "image/png")]);
        assert!(rendered.contains("banana"));
    }

    #[test]
    fn invalid_base64_is_a_validation_error() {
        let html = r#"<img src="data:image/png;base64,@@not-base64@@">"#;
        assert!(serialize_content(html, 0).is_err());
    }

    #[test]
    fn render_resolves_markers_to_static_urls() {
        let first = attachment(0, "image/png");
        let second = attachment(1, "image/webp");
        let html = r#"<img attachment-instanceid="0"><img attachment-instanceid="1"><img attachment-instanceid="9">"#;

        let rendered = render_content(html, &[first.clone(), second.clone()]);

        assert!(rendered.contains(&format!(r#"src="/static/attachments/{}.png""#, first.file_id)));
        assert!(rendered.contains(&format!(r#"src="/static/attachments/{}.webp""#, second.file_id)));
        // Marker 9 has no attachment: left without a source.
        assert!(rendered.contains(r#"attachment-instanceid="9""#));
    }

    #[test]
    fn serialize_then_render_round_trip() {
        let html = format!(
            r#"<img attachment-instanceid="0"><img src="{}">"#,
            data_uri("image/jpeg", b"fresh upload"),
        );

        let serialized = serialize_content(&html, 2).expect("serialize");
        assert_eq!(serialized.referenced, vec![0]);
        assert_eq!(serialized.new_images.len(), 1);

        let attachments = vec![attachment(0, "image/png"), attachment(2, "image/jpeg")];
        let rendered = render_content(&serialized.content, &attachments);

        // Every image in the rendered output resolves to a static URL.
        assert_eq!(rendered.matches("/static/attachments/").count(), 2);
    }

    #[test]
    fn sanitizer_strips_scripts_and_keeps_markers() {
        let html = r#"<script>alert(1)</script><img attachment-instanceid="1"><p class="lead">ok</p>"#;
        let clean = sanitize(html);

        assert!(!clean.contains("script"));
        assert!(clean.contains(r#"attachment-instanceid="1""#));
        assert!(clean.contains("ok"));
    }
}
