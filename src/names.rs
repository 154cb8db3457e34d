//! File-name rules for uploads: sanitising, collision-free renaming and
//! mime type guessing by extension.

/// Name used when nothing is left after sanitising
pub const FALLBACK_NAME: &str = "Datei";

fn is_letter_or_digit(c: char) -> bool {
    c.is_ascii_alphanumeric() || "äöüßÄÖÜ".contains(c)
}

fn valid_first(c: char) -> bool {
    is_letter_or_digit(c) || c == '_'
}

fn valid_rest(c: char) -> bool {
    is_letter_or_digit(c) || " _-()${}.,+€!=".contains(c)
}

pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => valid_first(first) && chars.all(valid_rest),
        None => false,
    }
}

/// Replace every disallowed character with `_`
pub fn make_valid_name(input: &str) -> String {
    if input.is_empty() {
        return FALLBACK_NAME.to_string();
    }
    input
        .chars()
        .enumerate()
        .map(|(i, c)| {
            let ok = if i == 0 { valid_first(c) } else { valid_rest(c) };
            if ok {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Trailing ` (n)` counter with one to three digits
fn counter_suffix(stem: &str) -> Option<(usize, u32)> {
    let inner = stem.strip_suffix(')')?;
    let open = inner.rfind(" (")?;
    let digits = &inner[open + 2..];
    if digits.is_empty() || digits.len() > 3 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((open, digits.parse().ok()?))
}

/// Sanitise `original` and, while the result is in `used`, bump a ` (n)`
/// counter in front of the extension: `a.png`, `a (1).png`, `a (2).png`.
pub fn generate_valid_file_name(original: &str, used: &[String]) -> String {
    let mut name = make_valid_name(original);
    while used.iter().any(|u| *u == name) {
        let (stem, ext) = match name.rfind('.') {
            Some(dot) if dot > 0 => (name[..dot].to_string(), name[dot..].to_string()),
            _ => (name.clone(), String::new()),
        };
        let stem = match counter_suffix(&stem) {
            Some((open, n)) => format!("{} ({})", &stem[..open], n + 1),
            None => format!("{stem} (1)"),
        };
        name = stem + &ext;
    }
    name
}

/// Mime type by extension for the formats display nodes handle
pub fn mime_for_name(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" => "video/mp4",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "odp" => "application/vnd.oasis.opendocument.presentation",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        _ => "application/octet-stream",
    }
}
