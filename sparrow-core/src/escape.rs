//! NMDC escaping: `$`, `|` and `&` cannot appear raw inside a command's text.

/// Escape chat or description text for sending.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '$' => out.push_str("&#36;"),
            '|' => out.push_str("&#124;"),
            _ => out.push(c),
        }
    }
    out
}

/// Undo NMDC escaping, plus the common HTML entities some hubs emit. Unknown entities are left as-is.
pub fn unescape(text: &str) -> String {
    const ENTITIES: [(&str, char); 7] = [
        ("&#36;", '$'),
        ("&#124;", '|'),
        ("&amp;", '&'),
        ("&lt;", '<'),
        ("&gt;", '>'),
        ("&quot;", '"'),
        ("&#39;", '\''),
    ];
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    'outer: while let Some(i) = rest.find('&') {
        out.push_str(&rest[..i]);
        rest = &rest[i..];
        for (entity, c) in ENTITIES {
            if let Some(after) = rest.strip_prefix(entity) {
                out.push(c);
                rest = after;
                continue 'outer;
            }
        }
        out.push('&');
        rest = &rest[1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_reserved() {
        assert_eq!(escape("a|b$c&d"), "a&#124;b&#36;c&amp;d");
        assert_eq!(escape("plain"), "plain");
    }

    #[test]
    fn unescape_reverses_escape() {
        let text = "price: $5 | tip & more";
        assert_eq!(unescape(&escape(text)), text);
    }

    #[test]
    fn unescape_html_and_unknown() {
        assert_eq!(unescape("&lt;bob&gt; hi"), "<bob> hi");
        assert_eq!(unescape("fish &chips; &"), "fish &chips; &");
    }
}
