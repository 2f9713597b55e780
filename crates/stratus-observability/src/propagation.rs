//! W3C Trace Context header handling
//!
//! Implements the `traceparent` wire format
//! (`00-<32 hex trace id>-<16 hex span id>-<2 hex flags>`). Malformed input
//! never errors; callers mint a fresh root context instead.

/// Header name for the W3C trace parent
pub const TRACEPARENT: &str = "traceparent";
/// Header name for vendor-specific trace state
pub const TRACESTATE: &str = "tracestate";

/// Sampled bit of the trace flags byte
pub const FLAG_SAMPLED: u8 = 0x01;

/// Parsed `traceparent` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: String,
    pub span_id: String,
    pub flags: u8,
}

impl TraceParent {
    /// Parse a `traceparent` value, returning `None` on any malformation
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;

        if version.len() != 2 || !is_lower_hex(version) || version == "ff" {
            return None;
        }
        if trace_id.len() != 32 || !is_lower_hex(trace_id) || all_zero(trace_id) {
            return None;
        }
        if span_id.len() != 16 || !is_lower_hex(span_id) || all_zero(span_id) {
            return None;
        }
        if flags.len() != 2 || !is_lower_hex(flags) {
            return None;
        }

        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            flags: u8::from_str_radix(flags, 16).ok()?,
        })
    }

    /// Render the header value
    pub fn format(&self) -> String {
        format!("00-{}-{}-{:02x}", self.trace_id, self.span_id, self.flags)
    }

    pub fn sampled(&self) -> bool {
        self.flags & FLAG_SAMPLED != 0
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn all_zero(s: &str) -> bool {
    s.bytes().all(|b| b == b'0')
}

/// Generate a random 32-hex-character trace id
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Generate a random 16-hex-character span id
pub fn new_span_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_valid_traceparent() {
        let tp =
            TraceParent::parse("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01").unwrap();
        assert_eq!(tp.trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(tp.span_id, "b7ad6b7169203331");
        assert!(tp.sampled());
    }

    #[test]
    fn format_round_trips_parse() {
        let raw = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";
        let tp = TraceParent::parse(raw).unwrap();
        assert_eq!(tp.format(), raw);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(TraceParent::parse("").is_none());
        assert!(TraceParent::parse("garbage").is_none());
        // uppercase hex is invalid per spec
        assert!(TraceParent::parse("00-0AF7651916CD43DD8448EB211C80319C-b7ad6b7169203331-01")
            .is_none());
        // all-zero trace id
        assert!(TraceParent::parse("00-00000000000000000000000000000000-b7ad6b7169203331-01")
            .is_none());
        // truncated span id
        assert!(TraceParent::parse("00-0af7651916cd43dd8448eb211c80319c-b7ad6b71-01").is_none());
        // version ff is reserved
        assert!(TraceParent::parse("ff-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
            .is_none());
    }

    #[test]
    fn generated_ids_have_wire_shape() {
        assert_eq!(new_trace_id().len(), 32);
        assert_eq!(new_span_id().len(), 16);
        assert!(is_lower_hex(&new_trace_id()));
    }
}
