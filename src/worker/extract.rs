//! Three-tier JSON extraction for the synthesis step (`spec.md` §4.7, §9):
//! strip code fences, then balance braces, then fall back to per-field
//! regex matching. Returns `None` only if every tier fails, at which point
//! the caller emits a skeleton report.

use std::sync::OnceLock;

use regex::Regex;

pub type Synthesis = (String, String, Vec<String>);

#[derive(serde::Deserialize)]
struct SynthesisFields {
    #[serde(alias = "root_cause_analysis")]
    root_cause_analysis: String,
    #[serde(alias = "impact_assessment")]
    impact_assessment: String,
    #[serde(alias = "suggested_remediation")]
    suggested_remediation: Vec<String>,
}

pub fn extract_synthesis_json(text: &str) -> Option<Synthesis> {
    tier_code_fence(text)
        .or_else(|| tier_brace_balance(text))
        .or_else(|| tier_field_regex(text))
}

fn tier_code_fence(text: &str) -> Option<Synthesis> {
    let fence = fence_regex();
    let stripped = fence.captures(text).map(|c| c[1].to_string());
    let candidate = stripped.unwrap_or_else(|| text.trim().to_string());
    parse_fields(&candidate)
}

fn tier_brace_balance(text: &str) -> Option<Synthesis> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut end = None;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + offset + 1);
                    break;
                }
            }
            _ => {}
        }
    }
    let end = end?;
    parse_fields(&text[start..end])
}

fn tier_field_regex(text: &str) -> Option<Synthesis> {
    let root_cause = field_regex("rootCauseAnalysis").captures(text).map(|c| c[1].to_string());
    let impact = field_regex("impactAssessment").captures(text).map(|c| c[1].to_string());
    let remediation = remediation_regex()
        .captures(text)
        .map(|c| {
            c[1].split(',')
                .map(|s| s.trim().trim_matches('"').to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    match (root_cause, impact) {
        (None, None) => None,
        (root_cause, impact) => Some((
            root_cause.unwrap_or_else(|| "unknown".into()),
            impact.unwrap_or_else(|| "unknown".into()),
            remediation,
        )),
    }
}

fn parse_fields(candidate: &str) -> Option<Synthesis> {
    let fields: SynthesisFields = serde_json::from_str(candidate).ok()?;
    Some((
        fields.root_cause_analysis,
        fields.impact_assessment,
        fields.suggested_remediation,
    ))
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").unwrap())
}

fn field_regex(name: &str) -> Regex {
    Regex::new(&format!(r#"(?i)"{name}"\s*:\s*"((?:[^"\\]|\\.)*)""#)).unwrap()
}

fn remediation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?is)"suggestedRemediation"\s*:\s*\[(.*?)\]"#).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_clean_json() {
        let text = r#"{"rootCauseAnalysis": "disk full", "impactAssessment": "checkout down", "suggestedRemediation": ["add disk"]}"#;
        let (cause, impact, remediation) = extract_synthesis_json(text).unwrap();
        assert_eq!(cause, "disk full");
        assert_eq!(impact, "checkout down");
        assert_eq!(remediation, vec!["add disk"]);
    }

    #[test]
    fn strips_code_fence() {
        let text = "Here is the analysis:\n```json\n{\"rootCauseAnalysis\": \"oom\", \"impactAssessment\": \"down\", \"suggestedRemediation\": []}\n```\nthanks";
        let (cause, _, _) = extract_synthesis_json(text).unwrap();
        assert_eq!(cause, "oom");
    }

    #[test]
    fn balances_braces_with_trailing_prose() {
        let text = r#"Sure, here you go: {"rootCauseAnalysis": "leak", "impactAssessment": "latency", "suggestedRemediation": ["restart"]} let me know if you need more."#;
        let (cause, impact, remediation) = extract_synthesis_json(text).unwrap();
        assert_eq!(cause, "leak");
        assert_eq!(impact, "latency");
        assert_eq!(remediation, vec!["restart"]);
    }

    #[test]
    fn falls_back_to_per_field_regex_on_malformed_json() {
        let text = r#"rootCauseAnalysis: "disk full", impactAssessment: "checkout down", suggestedRemediation: ["add disk", "page oncall"]"#;
        let (cause, impact, remediation) = extract_synthesis_json(text).unwrap();
        assert_eq!(cause, "disk full");
        assert_eq!(impact, "checkout down");
        assert_eq!(remediation, vec!["add disk", "page oncall"]);
    }

    #[test]
    fn returns_none_when_nothing_matches() {
        assert!(extract_synthesis_json("I couldn't determine anything useful.").is_none());
    }
}
