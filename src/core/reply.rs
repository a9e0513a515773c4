//! Best-effort split between the newest reply and quoted history.
//!
//! Boundaries are recognised by an extensible list of rules. A missed
//! boundary leaves quoted text in the reply; a false boundary would cut a real
//! message short, so an `On ... wrote:` line only counts when an address sits
//! right before `wrote:` or the line carries a real date or time.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};

/// `10:42`, `2024-03-05`, `5/3/24`, `5 March 2024` or `Mar 5, 2024`.
const DATE_OR_TIME: &str = concat!(
    r"\b\d{1,2}:\d{2}\b",
    r"|\b\d{4}-\d{2}-\d{2}\b",
    r"|\b\d{1,2}/\d{1,2}/\d{2,4}\b",
    r"|\b\d{1,2}\s+(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?,?\s+\d{4}\b",
    r"|\b(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{1,2},?\s+\d{4}\b",
);

#[derive(Debug, Clone)]
pub enum BoundaryRule {
    /// A single line that opens quoted history.
    Line(Regex),
    /// Two consecutive header lines (Outlook's `From:` followed by `Sent:`).
    HeaderPair { first: Regex, second: Regex },
}

impl BoundaryRule {
    fn matches_at(&self, lines: &[&str], idx: usize) -> bool {
        match self {
            BoundaryRule::Line(re) => re.is_match(lines[idx]),
            BoundaryRule::HeaderPair { first, second } => {
                first.is_match(lines[idx])
                    && lines.get(idx + 1).is_some_and(|next| second.is_match(next))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplyRules {
    rules: Vec<BoundaryRule>,
}

impl Default for ReplyRules {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ReplyRules {
    pub fn builtin() -> Self {
        ReplyRules {
            rules: vec![
                BoundaryRule::Line(builtin(r"^\s*>")),
                BoundaryRule::Line(builtin(
                    r"^\s*on\s.*\s(<[^<>\s]+@[^<>\s]+>|[^<>\s]+@[^<>\s]+),?\s*wrote:\s*$",
                )),
                BoundaryRule::Line(builtin(&format!(
                    r"^\s*on\s.*({DATE_OR_TIME}).*\swrote:\s*$"
                ))),
                BoundaryRule::Line(builtin(r"^\s*-{2,}\s*original message\s*-{2,}\s*$")),
                BoundaryRule::HeaderPair {
                    first: builtin(r"^\s*from:\s*\S"),
                    second: builtin(r"^\s*(sent|date):\s*\S"),
                },
            ],
        }
    }

    /// Built-in rules plus extra attribution lines, each compiled
    /// case-insensitively and matched against a whole line.
    pub fn with_extra_patterns<S: AsRef<str>>(extra: &[S]) -> Result<Self, regex::Error> {
        let mut rules = Self::builtin();
        for pattern in extra {
            let re = RegexBuilder::new(pattern.as_ref())
                .case_insensitive(true)
                .build()?;
            rules.push(BoundaryRule::Line(re));
        }
        Ok(rules)
    }

    pub fn push(&mut self, rule: BoundaryRule) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Text strictly before the first boundary line, with trailing blank
    /// lines trimmed. Without a boundary the whole body is the reply.
    pub fn extract_latest_reply(&self, body: &str) -> String {
        if body.is_empty() {
            return String::new();
        }

        let text = normalize(body);
        let lines: Vec<&str> = text.split('\n').collect();
        let cut = (0..lines.len())
            .find(|&idx| self.rules.iter().any(|r| r.matches_at(&lines, idx)))
            .unwrap_or(lines.len());

        lines[..cut].join("\n").trim_end().to_string()
    }
}

/// [`ReplyRules::extract_latest_reply`] with the built-in rules.
pub fn extract_latest_reply(body: &str) -> String {
    static RULES: OnceLock<ReplyRules> = OnceLock::new();
    RULES.get_or_init(ReplyRules::builtin).extract_latest_reply(body)
}

/// Line endings, non-breaking spaces, and the two ways webmail wraps a long
/// attribution line.
pub(crate) fn normalize(body: &str) -> String {
    static WRAPS: OnceLock<(Regex, Regex)> = OnceLock::new();
    let (before_wrote, inside_brackets) = WRAPS.get_or_init(|| {
        (
            builtin(r"(On [^\n]+<[^>\n]+>)\n(wrote:)"),
            builtin(r"(On [^\n]+)<\n([^>\n]+)>(\s*wrote:)"),
        )
    });

    let text = body
        .replace("\r\n", "\n")
        .replace(['\u{202f}', '\u{a0}'], " ");
    let text = before_wrote.replace_all(&text, "$1 $2");
    inside_brackets.replace_all(&text, "$1<$2>$3").into_owned()
}

fn builtin(expr: &str) -> Regex {
    RegexBuilder::new(expr)
        .case_insensitive(true)
        .build()
        .expect("built-in reply pattern")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn no_boundary_returns_whole_body() {
        let body = "This is a simple email with no quoted content.";
        assert_eq!(extract_latest_reply(body), body);
    }

    #[test]
    fn strips_attribution_and_quotes() {
        let body = "Thanks!\n\nOn Mon, Jan 27, 2026, John <j@x.com> wrote:\n> old content";
        assert_eq!(extract_latest_reply(body), "Thanks!");
    }

    #[test]
    fn strips_gmail_style_history() {
        let body = "Yes that is fine, I will email you in the morning.\n\n\
                    On Fri, Nov 16, 2012 at 1:48 PM, Test User <test@example.com> wrote:\n\n\
                    > Our support team just commented on your open Ticket:\n";
        assert_eq!(
            extract_latest_reply(body),
            "Yes that is fine, I will email you in the morning."
        );
    }

    #[test]
    fn bare_quote_marker_is_a_boundary() {
        let body = "Agreed.\n  > earlier text\nmore";
        assert_eq!(extract_latest_reply(body), "Agreed.");
    }

    #[test]
    fn outlook_header_block() {
        let body = "Thanks for the update.\n\nFrom: Test User <test@example.com>\n\
                    Sent: Monday, January 15, 2024 10:00 AM\nTo: Me <me@example.com>\n\n\
                    This is the original message that should be stripped.\n";
        assert_eq!(extract_latest_reply(body), "Thanks for the update.");
    }

    #[test]
    fn lone_from_line_is_not_a_boundary() {
        let body = "From: the desk of the CEO\nWe are moving offices.";
        assert_eq!(extract_latest_reply(body), body);
    }

    #[test]
    fn original_message_separator() {
        let body = "See below.\n-----Original Message-----\nold";
        assert_eq!(extract_latest_reply(body), "See below.");
    }

    #[test]
    fn crlf_and_unicode_spaces() {
        let body = "Thanks for the update.\r\n\r\nOn Mon, Jan 15, 2024 Test <test@example.com> wrote:\r\n\r\n> Original message";
        assert_eq!(extract_latest_reply(body), "Thanks for the update.");

        let body = "Reply here.\n\nOn Mon at 8:10\u{202f}AM Test <t@e.com> wrote:\n\n> Quoted";
        assert_eq!(extract_latest_reply(body), "Reply here.");
    }

    #[test]
    fn wrapped_attribution_lines() {
        let body = "Hi, sounds good.\n\nOn Mon, 19 Jan 2026, 14:00 Test User, <test@example.com>\nwrote:\n\n> Previous message content\n";
        assert_eq!(extract_latest_reply(body), "Hi, sounds good.");

        let body = "Thanks!\n\nOn Tue, Jan 27, 2026 at 8:10\u{202f}AM Test User <\ntest@example.com> wrote:\n\n> Previous content\n";
        assert_eq!(extract_latest_reply(body), "Thanks!");
    }

    #[test]
    fn mentions_of_wrote_do_not_truncate() {
        let body = "On Monday the team wrote: a plan.\nOn reflection Alice wrote:\nIt works.";
        assert_eq!(extract_latest_reply(body), body);
    }

    #[test]
    fn prose_with_numbers_is_not_an_attribution() {
        let body = "Status update.\nOn 2 occasions the auditor wrote:\n- missing receipts\n- late filings";
        assert_eq!(extract_latest_reply(body), body);

        let body = "On 3 sites in 2024 the inspector wrote:\nAll clear.";
        assert_eq!(extract_latest_reply(body), body);
    }

    #[test]
    fn dated_attributions_without_an_address() {
        let body = "Done.\nOn 2024-03-05, Bob wrote:\n> old";
        assert_eq!(extract_latest_reply(body), "Done.");

        let body = "Done.\nOn 5 March 2024, Bob Smith wrote:\n> old";
        assert_eq!(extract_latest_reply(body), "Done.");

        let body = "Done.\nOn Tuesday at 09:15, Bob wrote:\n> old";
        assert_eq!(extract_latest_reply(body), "Done.");
    }

    #[test]
    fn extra_patterns_extend_builtin_rules() {
        let rules = ReplyRules::with_extra_patterns(&[r"^Le .* a écrit\s*:\s*$"]).unwrap();
        assert_eq!(rules.len(), ReplyRules::builtin().len() + 1);
        let body = "Merci.\nLe lun. 3 févr. 2025, Jean a écrit :\n> vieux";
        assert_eq!(rules.extract_latest_reply(body), "Merci.");
        assert!(ReplyRules::with_extra_patterns(&["(unclosed"]).is_err());
    }

    #[test]
    fn empty_body() {
        assert_eq!(extract_latest_reply(""), "");
    }

    proptest! {
        #[test]
        fn reply_is_a_prefix_of_normalized_body(body in "[a-zA-Z0-9 >:<@.,\n]{0,200}") {
            let reply = extract_latest_reply(&body);
            prop_assert!(normalize(&body).starts_with(&reply));
        }

        #[test]
        fn extraction_is_deterministic(body in "\\PC{0,120}") {
            prop_assert_eq!(extract_latest_reply(&body), extract_latest_reply(&body));
        }
    }
}
