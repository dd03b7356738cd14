//! Static shells and the shell/fill merge.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Where a shell-only render stopped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PostponeMarker {
    /// Byte offset in the output at which per-request content goes.
    pub position: usize,
    /// What dynamic access stopped the render.
    pub reason: String,
}

/// A cached static shell.
///
/// `prefix` is everything rendered before the first dynamic access and
/// `tail` the closing content registered before it. The per-request
/// remainder belongs between the two, at `marker.position`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellPayload {
    #[serde(with = "edge_cache::base64_bytes")]
    pub prefix: Bytes,
    #[serde(with = "edge_cache::base64_bytes")]
    pub tail: Bytes,
    pub marker: PostponeMarker,
}

impl ShellPayload {
    /// Encode for storage as an opaque cache value.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a stored shell.
    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Shell bytes with the hole left empty.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.prefix.len() + self.tail.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(&self.tail);
        Bytes::from(out)
    }

    /// Splice a per-request render into the shell.
    ///
    /// `fill` is the complete output of a full render of the same unit. Its
    /// content between the shell prefix and the shell tail is the dynamic
    /// remainder. Returns `None` when `fill` does not start with the prefix
    /// and end with the tail; the shell's static bytes are never rewritten.
    pub fn merge(&self, fill: &[u8]) -> Option<Bytes> {
        let fixed = self.prefix.len() + self.tail.len();
        if fill.len() < fixed || !fill.starts_with(&self.prefix) || !fill.ends_with(&self.tail) {
            return None;
        }

        let remainder = &fill[self.prefix.len()..fill.len() - self.tail.len()];
        let mut out = Vec::with_capacity(fill.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(remainder);
        out.extend_from_slice(&self.tail);
        Some(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> ShellPayload {
        ShellPayload {
            prefix: Bytes::from_static(b"<html><body><h1>Shop</h1>"),
            tail: Bytes::from_static(b"</body></html>"),
            marker: PostponeMarker {
                position: 25,
                reason: "cookies".into(),
            },
        }
    }

    #[test]
    fn test_merge_splices_remainder() {
        let merged = shell()
            .merge(b"<html><body><h1>Shop</h1><p>Hi Ana</p></body></html>")
            .unwrap();
        assert_eq!(&merged[..], b"<html><body><h1>Shop</h1><p>Hi Ana</p></body></html>");
    }

    #[test]
    fn test_merge_empty_remainder() {
        let merged = shell().merge(b"<html><body><h1>Shop</h1></body></html>").unwrap();
        assert_eq!(merged, shell().to_bytes());
    }

    #[test]
    fn test_merge_rejects_prefix_mismatch() {
        assert!(shell()
            .merge(b"<html><body><h1>Sale</h1><p>x</p></body></html>")
            .is_none());
    }

    #[test]
    fn test_merge_rejects_overlapping_prefix_and_tail() {
        assert!(shell().merge(b"<html><body>").is_none());
    }

    #[test]
    fn test_payload_round_trip() {
        let payload = shell();
        assert_eq!(ShellPayload::decode(&payload.encode().unwrap()).unwrap(), payload);
        assert_eq!(payload.marker.position, payload.prefix.len());
    }
}
