//! Key composition shared by the web, metadata and storage surfaces.
//!
//! The layouts are load-bearing: the same strings decide ring placement,
//! relational rows and blob paths, so they live in one place.

/// Bucket that holds every video segment blob.
pub const SEGMENT_BUCKET: &str = "videos";

/// Placement key fed to the consistent-hash ring for a segment.
pub fn placement_key(video_id: &str, rendition: &str, idx: u64) -> String {
    format!("{}|{}|{}", video_id, rendition, idx)
}

/// Relational metadata key for a segment placement record.
pub fn segment_metadata_key(video_id: &str, rendition: &str, idx: u64) -> String {
    format!("segment/{}/{}/{}", video_id, rendition, idx)
}

/// Relational metadata key for a video record.
pub fn video_metadata_key(video_id: &str) -> String {
    format!("video/{}", video_id)
}

/// Object path of a segment inside [`SEGMENT_BUCKET`].
pub fn segment_object_path(video_id: &str, rendition: &str, idx: u64) -> String {
    format!("{}/{}/{}", video_id, rendition, idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layouts() {
        assert_eq!(placement_key("v1", "720p", 0), "v1|720p|0");
        assert_eq!(segment_metadata_key("v1", "720p", 7), "segment/v1/720p/7");
        assert_eq!(video_metadata_key("v1"), "video/v1");
        assert_eq!(segment_object_path("v1", "720p", 7), "v1/720p/7");
    }
}
