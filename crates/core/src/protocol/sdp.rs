//! Rewrites the transcoder's session description for clients (RFC 2326 §10.2,
//! RFC 4566).
//!
//! The transcoder prints an SDP document for outputs it has not started
//! sending yet. That text is almost, but not quite, what DESCRIBE must
//! return; while streaming the lines through, this module:
//!
//! - zeroes every `m=` line's port (clients must wait for SETUP to learn
//!   real ports),
//! - provisions each section with `b=RR:0` unless it already carries a
//!   bandwidth line, replacing any `b=RR:` the transcoder emitted,
//! - strips incoming `a=control:` attributes and closes each media section
//!   with `a=control:<ordinal>` instead,
//! - closes the session-level section with `a=range:npt=0-<duration>`,
//! - omits the `s=` line when the resource has no title (players handle a
//!   missing session name better than a blank one),
//! - counts the media sections.
//!
//! A line that strips to nothing terminates the description; EOF without
//! that terminator means the transcoder died mid-output.

use std::io::BufRead;

use crate::error::{Result, RtspError};

/// The rewritten description plus its elementary-stream count.
#[derive(Debug)]
pub struct RewrittenSdp {
    pub sdp: String,
    pub streams: usize,
}

/// Line types that end the preamble of a section: the first of these (or the
/// section terminator) is where a missing `b=RR:0` gets inserted.
const ATTRIBUTE_KINDS: &[u8] = b"trzkam";

pub fn rewrite_description(
    reader: &mut impl BufRead,
    duration: &str,
    has_title: bool,
) -> Result<RewrittenSdp> {
    let mut sdp = String::new();
    let mut streams = 0usize;
    let mut bandwidth_done = false;
    let mut first = true;
    let mut raw = String::new();

    loop {
        raw.clear();
        if reader.read_line(&mut raw).map_err(RtspError::Io)? == 0 {
            return Err(RtspError::TruncatedDescription);
        }
        let line = raw.trim();

        // The transcoder unhelpfully prefixes its output with this marker.
        if first {
            first = false;
            if line == "SDP:" {
                continue;
            }
        }

        let kind = line.bytes().next();
        let replaces_bandwidth = line.starts_with("b=RR:");

        if !bandwidth_done {
            if replaces_bandwidth || kind.is_none_or(|k| ATTRIBUTE_KINDS.contains(&k)) {
                sdp.push_str("b=RR:0\r\n");
                bandwidth_done = true;
            } else if line.starts_with("b=") {
                bandwidth_done = true;
            }
        }

        // `m=` opens the next section; a blank line closes the last one.
        // Either way the finished section gets its closing attribute.
        if kind.is_none() || kind == Some(b'm') {
            if streams > 0 {
                sdp.push_str(&format!("a=control:{}\r\n", streams - 1));
            } else {
                sdp.push_str(&format!("a=range:npt=0-{}\r\n", duration));
            }
            bandwidth_done = false;
        }

        let Some(kind) = kind else {
            break;
        };

        let mut emit: Option<String> = Some(line.to_string());
        if replaces_bandwidth {
            emit = None;
        }
        if kind == b'm' {
            emit = Some(zero_media_port(line));
            streams += 1;
        }
        if kind == b's' && !has_title {
            emit = None;
        }

        if let Some(text) = emit
            && !text.starts_with("a=control:")
        {
            sdp.push_str(&text);
            sdp.push_str("\r\n");
        }
    }

    Ok(RewrittenSdp { sdp, streams })
}

/// Replace the port field of an `m=` line with 0.
fn zero_media_port(line: &str) -> String {
    let mut fields = line.splitn(3, ' ');
    match (fields.next(), fields.next(), fields.next()) {
        (Some(media), Some(_port), Some(rest)) => format!("{} 0 {}", media, rest),
        _ => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSCODER_OUTPUT: &str = "SDP:\n\
        v=0\n\
        o=- 0 0 IN IP4 127.0.0.1\n\
        s=Big Adventure\n\
        c=IN IP4 127.0.0.1\n\
        t=0 0\n\
        a=tool:libavformat\n\
        m=video 6970 RTP/AVP 96\n\
        b=AS:1227\n\
        a=rtpmap:96 MP4V-ES/90000\n\
        a=control:streamid=0\n\
        m=audio 6972 RTP/AVP 97\n\
        b=AS:156\n\
        a=rtpmap:97 MPEG4-GENERIC/48000/2\n\
        \n";

    fn rewrite(input: &str, duration: &str, has_title: bool) -> RewrittenSdp {
        rewrite_description(&mut input.as_bytes(), duration, has_title).unwrap()
    }

    #[test]
    fn rewrites_transcoder_output() {
        let out = rewrite(TRANSCODER_OUTPUT, "596.48", true);
        assert_eq!(out.streams, 2);

        let sdp = &out.sdp;
        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("s=Big Adventure\r\n"));

        // Ports zeroed, original control attributes replaced by ordinals.
        assert!(sdp.contains("m=video 0 RTP/AVP 96\r\n"));
        assert!(sdp.contains("m=audio 0 RTP/AVP 97\r\n"));
        assert!(!sdp.contains("streamid"));
        assert!(!sdp.contains("6970"));

        // Each media section closes with its control ordinal.
        let video = sdp.find("m=video").unwrap();
        let control0 = sdp.find("a=control:0\r\n").unwrap();
        let audio = sdp.find("m=audio").unwrap();
        let control1 = sdp.find("a=control:1\r\n").unwrap();
        assert!(video < control0 && control0 < audio && audio < control1);
        assert!(sdp.ends_with("a=control:1\r\n"));

        // Session section closes with the play range.
        let range = sdp.find("a=range:npt=0-596.48\r\n").unwrap();
        assert!(range < video);

        // Session section is provisioned with b=RR:0 before its first
        // attribute line; media sections already carry b=AS.
        let rr = sdp.find("b=RR:0\r\n").unwrap();
        let timing = sdp.find("t=0 0").unwrap();
        assert!(rr < timing);
        assert_eq!(sdp.matches("b=RR:0").count(), 1);
        assert!(sdp.contains("b=AS:1227\r\n"));
        assert!(sdp.contains("b=AS:156\r\n"));
    }

    #[test]
    fn session_name_omitted_without_title() {
        let out = rewrite(TRANSCODER_OUTPUT, "1", false);
        assert!(!out.sdp.contains("s="));
        assert!(out.sdp.contains("o=- 0 0"));
    }

    #[test]
    fn existing_receiver_bandwidth_replaced() {
        let input = "v=0\nb=RR:409600\nt=0 0\nm=video 100 RTP/AVP 96\na=rtpmap:96 X\n\n";
        let out = rewrite(input, "2", false);
        assert!(!out.sdp.contains("b=RR:409600"));
        let session = out.sdp.find("b=RR:0\r\nt=0 0").unwrap();
        assert!(session < out.sdp.find("m=video").unwrap());
    }

    #[test]
    fn bare_media_section_gets_receiver_bandwidth() {
        let input = "v=0\nt=0 0\nm=video 100 RTP/AVP 96\na=rtpmap:96 X\n\n";
        let out = rewrite(input, "2", false);
        // One b=RR:0 for the session section, one for the media section.
        assert_eq!(out.sdp.matches("b=RR:0").count(), 2);
        let media = out.sdp.find("m=video").unwrap();
        let media_rr = out.sdp.rfind("b=RR:0").unwrap();
        assert!(media < media_rr);
        assert!(media_rr < out.sdp.find("a=rtpmap").unwrap());
    }

    #[test]
    fn truncated_description_is_an_error() {
        let input = "v=0\nt=0 0\nm=video 100 RTP/AVP 96\n";
        let err = rewrite_description(&mut input.as_bytes(), "2", false).unwrap_err();
        assert!(matches!(err, RtspError::TruncatedDescription));
    }

    #[test]
    fn empty_description_yields_session_range() {
        let out = rewrite("\n", "42.5", false);
        assert_eq!(out.streams, 0);
        assert!(out.sdp.contains("a=range:npt=0-42.5\r\n"));
    }
}
