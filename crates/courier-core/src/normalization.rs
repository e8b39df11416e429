/// Turn an owner entry into a transport address.
///
/// Entries that already carry a domain (`user@server`) are kept; bare numbers
/// get `@{domain}` appended. Returns `None` for blank entries.
pub fn normalize_recipient(raw: &str, domain: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains('@') {
        return Some(trimmed.to_owned());
    }

    let local = trimmed.trim_start_matches('+');
    Some(format!("{local}@{domain}"))
}

/// Normalize a comma-separated recipient list, dropping blanks and duplicates.
pub fn normalize_recipients(raw: &str, domain: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for entry in raw.split(',') {
        if let Some(recipient) = normalize_recipient(entry, domain)
            && !out.contains(&recipient)
        {
            out.push(recipient);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_domain_to_bare_numbers() {
        assert_eq!(
            normalize_recipient("254700143167", "s.whatsapp.net").as_deref(),
            Some("254700143167@s.whatsapp.net")
        );
        assert_eq!(
            normalize_recipient(" +15550001 ", "s.whatsapp.net").as_deref(),
            Some("15550001@s.whatsapp.net")
        );
    }

    #[test]
    fn keeps_full_addresses() {
        assert_eq!(
            normalize_recipient("12345@g.us", "s.whatsapp.net").as_deref(),
            Some("12345@g.us")
        );
    }

    #[test]
    fn list_drops_blanks_and_duplicates() {
        let recipients = normalize_recipients("111, ,222,111@s.whatsapp.net,", "s.whatsapp.net");
        assert_eq!(
            recipients,
            vec![
                "111@s.whatsapp.net".to_owned(),
                "222@s.whatsapp.net".to_owned()
            ]
        );
    }
}
