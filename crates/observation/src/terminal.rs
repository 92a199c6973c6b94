use crate::schema::Observation;

/// Free-text sentinels bracketing the terminal observation block.
pub const BLOCK_START: &str = "=== BEGIN AGENT OBSERVATION ===";
pub const BLOCK_END: &str = "=== END AGENT OBSERVATION ===";

pub fn contains_block_start(text: &str) -> bool {
    text.lines().any(|line| line.trim() == BLOCK_START)
}

/// Extracts the first sentinel-bracketed JSON document, stripping optional
/// code-fence decoration. Later blocks are ignored; an unterminated or
/// unparseable first block yields `None` (extraction is never fatal).
pub fn extract_terminal_block(text: &str) -> Option<Observation> {
    let mut lines = text.lines();
    lines.by_ref().find(|line| line.trim() == BLOCK_START)?;

    let mut body: Vec<&str> = Vec::new();
    let mut closed = false;
    for line in lines {
        if line.trim() == BLOCK_END {
            closed = true;
            break;
        }
        body.push(line);
    }
    if !closed {
        return None;
    }

    let body = strip_fences(&body).join("\n");
    let mut observation: Observation = serde_json::from_str(&body).ok()?;
    observation.normalize();
    Some(observation)
}

fn strip_fences<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    let mut start = 0;
    let mut end = lines.len();
    while start < end && lines[start].trim().is_empty() {
        start += 1;
    }
    while end > start && lines[end - 1].trim().is_empty() {
        end -= 1;
    }
    if start < end && lines[start].trim_start().starts_with("```") {
        start += 1;
    }
    if end > start && lines[end - 1].trim() == "```" {
        end -= 1;
    }
    lines[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(inner: &str) -> String {
        format!("chatter before\n{BLOCK_START}\n{inner}\n{BLOCK_END}\nchatter after\n")
    }

    #[test]
    fn extracts_bare_json_block() {
        let text = block("{\"sessionSummary\":\"ok\",\"verdict\":{\"nps\":7}}");
        let observation = extract_terminal_block(&text).unwrap();
        assert_eq!(observation.session_summary, "ok");
        assert_eq!(observation.verdict.nps, 7);
    }

    #[test]
    fn strips_code_fences() {
        let text = block("```json\n{\"sessionSummary\":\"fenced\"}\n```");
        let observation = extract_terminal_block(&text).unwrap();
        assert_eq!(observation.session_summary, "fenced");
    }

    #[test]
    fn only_the_first_block_is_used() {
        let text = format!(
            "{}{}",
            block("{\"sessionSummary\":\"first\"}"),
            block("{\"sessionSummary\":\"second\"}")
        );
        let observation = extract_terminal_block(&text).unwrap();
        assert_eq!(observation.session_summary, "first");
    }

    #[test]
    fn unterminated_block_yields_none() {
        let text = format!("{BLOCK_START}\n{{\"sessionSummary\":\"x\"}}\n");
        assert!(extract_terminal_block(&text).is_none());
    }

    #[test]
    fn malformed_first_block_yields_none() {
        let text = format!(
            "{}{}",
            block("{not json"),
            block("{\"sessionSummary\":\"second\"}")
        );
        assert!(extract_terminal_block(&text).is_none());
    }

    #[test]
    fn clamps_nps_from_terminal_block() {
        let text = block("{\"verdict\":{\"nps\":15}}");
        assert_eq!(extract_terminal_block(&text).unwrap().verdict.nps, 10);
    }
}
