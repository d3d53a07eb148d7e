//! Minimal TwiML-equivalent XML builders.
//!
//! Only the two documents the platform emits: the `<Connect><Stream>`
//! response that points the provider's media socket at this service,
//! and the fallback apology.

/// Escape a value for use in XML attribute or text position.
fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Build the stream-connect document. `parameters` become
/// `<Parameter>` elements the provider echoes back in the media
/// stream's `start.customParameters`.
pub fn connect_stream(stream_url: &str, parameters: &[(&str, &str)]) -> String {
    let mut doc = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Connect>");
    doc.push_str(&format!("<Stream url=\"{}\">", xml_escape(stream_url)));
    for (name, value) in parameters {
        if value.is_empty() {
            continue;
        }
        doc.push_str(&format!(
            "<Parameter name=\"{}\" value=\"{}\"/>",
            xml_escape(name),
            xml_escape(value)
        ));
    }
    doc.push_str("</Stream></Connect></Response>");
    doc
}

/// Apology-and-hang-up document served from the fallback webhook.
pub fn fallback_apology() -> String {
    "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response>\
     <Say>We are sorry, an application error has occurred. Goodbye.</Say>\
     <Hangup/></Response>"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_attribute_values() {
        let doc = connect_stream(
            "wss://example.com/stream",
            &[("prompt", "say \"hi\" & <wave>")],
        );
        assert!(doc.contains("say &quot;hi&quot; &amp; &lt;wave&gt;"));
        assert!(!doc.contains("<wave>"));
    }

    #[test]
    fn skips_empty_parameters() {
        let doc = connect_stream("wss://x/s", &[("prompt", ""), ("name", "Ada")]);
        assert!(!doc.contains("prompt"));
        assert!(doc.contains("name=\"name\" value=\"Ada\""));
    }

    #[test]
    fn fallback_hangs_up() {
        let doc = fallback_apology();
        assert!(doc.contains("<Hangup/>"));
        assert!(doc.starts_with("<?xml"));
    }
}
