//! Declarative validation of record headers against the WARC standard.
//!
//! Each field gets a [`FieldRule`]: a value pattern, whether it may repeat,
//! which record types it is forbidden or mandatory on. Validation walks the
//! header map once and returns human-readable violation strings rather than
//! failing fast, so a QA pass over an archive can report everything wrong
//! with a record in one go.
//!
//! The value patterns are slightly relaxed from the WARC 1.1 grammar for
//! compatibility with WARC 1.0 output and with the community annotations:
//! angle-bracketed URIs are accepted where old tools wrote them, and digest
//! values admit `/` and `@` for base64.

use std::collections::HashMap;

use regex::Regex;

use crate::headers::MessageHeaders;

struct FieldRule {
    pattern: Option<Regex>,
    repeatable: bool,
    forbidden_on: Vec<&'static str>,
}

impl FieldRule {
    fn new() -> Self {
        FieldRule {
            pattern: None,
            repeatable: false,
            forbidden_on: Vec::new(),
        }
    }

    fn pattern(mut self, re: &str) -> Self {
        // Full-match semantics, like the grammar productions these mirror.
        self.pattern = Some(Regex::new(&format!("^(?:{})$", re)).expect("built-in pattern"));
        self
    }

    fn repeatable(mut self) -> Self {
        self.repeatable = true;
        self
    }

    fn forbid_on(mut self, types: &[&'static str]) -> Self {
        self.forbidden_on.extend_from_slice(types);
        self
    }
}

/// Validates header maps against a configured rule set.
pub struct HeaderValidator {
    fields: HashMap<String, FieldRule>,
    mandatory: Vec<&'static str>,
    mandatory_by_type: Vec<(&'static str, &'static str)>,
    forbid_unknown: bool,
}

const URI: &str = "(?:[a-zA-Z][a-zA-Z0-9+.-]*:)?.*";
const NON_NEGATIVE_INTEGER: &str = "[0-9]+";
const TOKEN: &str = "[-!#$%&'*+.^_`|~0-9A-Za-z]+";

impl HeaderValidator {
    /// Rules for the WARC 1.1 standard. Unknown extension fields and
    /// extension values for `WARC-Type`, `WARC-Truncated` and
    /// `WARC-Profile` are ignored unless `forbid_extensions` is set.
    pub fn warc_1_1(forbid_extensions: bool) -> Self {
        Self::build(true, forbid_extensions)
    }

    /// Rules for WARC 1.0: as 1.1 except sub-second precision in dates is
    /// not allowed.
    pub fn warc_1_0(forbid_extensions: bool) -> Self {
        Self::build(false, forbid_extensions)
    }

    fn build(subsecond_dates: bool, forbid_extensions: bool) -> Self {
        let bracketed_uri = format!("<{URI}>|{URI}");
        let record_id = format!("<{URI}>");
        let date = if subsecond_dates {
            r"\d{4}(-\d{2}(-\d{2}(T\d{2}:\d{2}(:\d{2}(\.\d+)?(Z|[+-]\d{2}:\d{2})?)?)?)?)?"
        } else {
            r"\d{4}(-\d{2}(-\d{2}(T\d{2}:\d{2}(:\d{2}(Z|[+-]\d{2}:\d{2})?)?)?)?)?"
        };
        let ows = "[ \\t]*";
        let quoted_string = "\"(?:[^\"\\x00-\\x1F\\x7F]|\\\\.)*\"";
        let parameter = format!("{TOKEN}=(?:{TOKEN}|{quoted_string})");
        let media_type = format!("{TOKEN}/{TOKEN}{ows}(?:;{ows}{parameter})*");
        // Digest values admit / and @ so base64 output validates too.
        let labelled_digest = format!("{TOKEN}:[-!#$%&'*+.^_`|~0-9A-Za-z/@=]+");

        let mut v = HeaderValidator {
            fields: HashMap::new(),
            mandatory: vec!["WARC-Record-ID", "Content-Length", "WARC-Date", "WARC-Type"],
            mandatory_by_type: vec![
                ("response", "WARC-Target-URI"),
                ("resource", "WARC-Target-URI"),
                ("request", "WARC-Target-URI"),
                ("revisit", "WARC-Target-URI"),
                ("conversion", "WARC-Target-URI"),
                ("continuation", "WARC-Target-URI"),
                ("revisit", "WARC-Profile"),
                ("continuation", "WARC-Segment-Origin-ID"),
            ],
            forbid_unknown: forbid_extensions,
        };

        v.add("WARC-Record-ID", FieldRule::new().pattern(&record_id));
        v.add(
            "Content-Length",
            FieldRule::new().pattern(NON_NEGATIVE_INTEGER),
        );
        v.add("WARC-Date", FieldRule::new().pattern(date));
        let type_rule = if forbid_extensions {
            FieldRule::new()
                .pattern("warcinfo|response|resource|request|metadata|revisit|conversion|continuation")
        } else {
            FieldRule::new()
        };
        v.add("WARC-Type", type_rule);
        v.add("Content-Type", FieldRule::new().pattern(&media_type));
        v.add(
            "WARC-Concurrent-To",
            FieldRule::new()
                .pattern(&record_id)
                .repeatable()
                .forbid_on(&["warcinfo", "conversion", "continuation"]),
        );
        v.add("WARC-Block-Digest", FieldRule::new().pattern(&labelled_digest));
        v.add(
            "WARC-Payload-Digest",
            FieldRule::new().pattern(&labelled_digest),
        );
        v.add(
            "WARC-IP-Address",
            FieldRule::new().forbid_on(&["warcinfo", "conversion", "continuation"]),
        );
        v.add(
            "WARC-Refers-To",
            FieldRule::new().pattern(&record_id).forbid_on(&[
                "warcinfo",
                "response",
                "resource",
                "request",
                "continuation",
            ]),
        );
        v.add(
            "WARC-Refers-To-Target-URI",
            FieldRule::new().pattern(URI).forbid_on(&[
                "warcinfo",
                "response",
                "metadata",
                "conversion",
                "resource",
                "request",
                "continuation",
            ]),
        );
        v.add(
            "WARC-Refers-To-Date",
            FieldRule::new().pattern(date).forbid_on(&[
                "warcinfo",
                "response",
                "metadata",
                "conversion",
                "resource",
                "request",
                "continuation",
            ]),
        );
        v.add(
            "WARC-Target-URI",
            FieldRule::new()
                .pattern(&bracketed_uri)
                .forbid_on(&["warcinfo"]),
        );
        let truncated_rule = if forbid_extensions {
            FieldRule::new().pattern("length|time|disconnect|unspecified")
        } else {
            FieldRule::new()
        };
        v.add("WARC-Truncated", truncated_rule);
        v.add(
            "WARC-Warcinfo-ID",
            FieldRule::new().pattern(&record_id).forbid_on(&["warcinfo"]),
        );
        v.add(
            "WARC-Filename",
            FieldRule::new().forbid_on(&[
                "revisit",
                "response",
                "metadata",
                "conversion",
                "resource",
                "request",
                "continuation",
            ]),
        );
        let profile_rule = if forbid_extensions {
            FieldRule::new()
                .pattern(&format!(
                    "{}|{}",
                    regex::escape("http://netpreserve.org/warc/1.1/revisit/identical-payload-digest"),
                    regex::escape("http://netpreserve.org/warc/1.1/revisit/server-not-modified"),
                ))
                .forbid_on(&[
                    "warcinfo",
                    "response",
                    "metadata",
                    "conversion",
                    "resource",
                    "request",
                    "continuation",
                ])
        } else {
            FieldRule::new().pattern(&bracketed_uri)
        };
        v.add("WARC-Profile", profile_rule);
        v.add(
            "WARC-Identified-Payload-Type",
            FieldRule::new().pattern(&media_type),
        );
        v.add(
            "WARC-Segment-Number",
            FieldRule::new().pattern(NON_NEGATIVE_INTEGER),
        );
        v.add(
            "WARC-Segment-Origin-ID",
            FieldRule::new().pattern(&record_id).forbid_on(&[
                "warcinfo",
                "response",
                "metadata",
                "conversion",
                "resource",
                "request",
                "revisit",
            ]),
        );
        v.add(
            "WARC-Segment-Total-Length",
            FieldRule::new().pattern(NON_NEGATIVE_INTEGER).forbid_on(&[
                "warcinfo",
                "response",
                "metadata",
                "conversion",
                "resource",
                "request",
                "revisit",
            ]),
        );
        v
    }

    fn add(&mut self, name: &str, rule: FieldRule) {
        self.fields.insert(name.to_ascii_lowercase(), rule);
    }

    /// Checks the headers, returning one message per violation. An empty
    /// result means the record conforms.
    pub fn validate(&self, headers: &MessageHeaders) -> Vec<String> {
        let mut violations = Vec::new();
        let record_type = headers.first("WARC-Type");

        // Group values by field, preserving first-occurrence order.
        let mut grouped: Vec<(&str, Vec<&str>)> = Vec::new();
        for (name, value) in headers.iter() {
            match grouped.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name.as_str())) {
                Some((_, values)) => values.push(value),
                None => grouped.push((name.as_str(), vec![value])),
            }
        }

        for (name, values) in &grouped {
            let rule = match self.fields.get(&name.to_ascii_lowercase()) {
                Some(rule) => rule,
                None => {
                    if self.forbid_unknown {
                        violations.push(format!("Unknown field: {}", name));
                    }
                    continue;
                }
            };
            if !rule.repeatable && values.len() > 1 {
                violations.push(format!("Field must not be repeated: {}", name));
            }
            if let Some(rt) = record_type {
                if rule.forbidden_on.iter().any(|t| *t == rt) {
                    violations.push(format!("Field not allowed on {} record: {}", rt, name));
                }
            }
            if let Some(pattern) = &rule.pattern {
                for value in values {
                    if !pattern.is_match(value) {
                        violations.push(format!("Field has invalid value: {}", value));
                    }
                }
            }
        }

        for field in self.mandatory.iter().copied() {
            if headers.first(field).is_none() {
                violations.push(format!("Missing mandatory field: {}", field));
            }
        }
        if let Some(rt) = record_type {
            for (on_type, field) in self.mandatory_by_type.iter().copied() {
                if on_type == rt && headers.first(field).is_none() {
                    violations.push(format!(
                        "Missing mandatory field for {} record: {}",
                        rt, field
                    ));
                }
            }
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderName;

    fn headers(fields: &[(&str, &str)]) -> MessageHeaders {
        let mut h = MessageHeaders::new();
        for (name, value) in fields {
            h.append(HeaderName::new(*name).unwrap(), *value);
        }
        h
    }

    fn minimal(warc_type: &str) -> Vec<(&'static str, String)> {
        vec![
            ("WARC-Type", warc_type.to_string()),
            ("WARC-Record-ID", "<urn:uuid:92283950-ef2f-4d72-b224-f54c6ec90bb0>".to_string()),
            ("Content-Length", "0".to_string()),
            ("WARC-Date", "2016-09-19T17:20:24Z".to_string()),
        ]
    }

    fn check(warc_type: &str, extra: &[(&str, &str)]) -> Vec<String> {
        let mut fields: Vec<(&str, &str)> = Vec::new();
        let base = minimal(warc_type);
        for (n, v) in &base {
            fields.push((*n, v.as_str()));
        }
        fields.extend_from_slice(extra);
        HeaderValidator::warc_1_1(false).validate(&headers(&fields))
    }

    #[test]
    fn conforming_record_passes() {
        let violations = check("metadata", &[]);
        assert!(violations.is_empty(), "{:?}", violations);
    }

    #[test]
    fn missing_mandatory_field() {
        let h = headers(&[
            ("WARC-Type", "metadata"),
            ("Content-Length", "0"),
            ("WARC-Date", "2016-09-19T17:20:24Z"),
        ]);
        let violations = HeaderValidator::warc_1_1(false).validate(&h);
        assert_eq!(violations, vec!["Missing mandatory field: WARC-Record-ID"]);
    }

    #[test]
    fn missing_target_uri_on_response() {
        let violations = check("response", &[]);
        assert_eq!(
            violations,
            vec!["Missing mandatory field for response record: WARC-Target-URI"]
        );
    }

    #[test]
    fn repeated_non_repeatable_field() {
        let violations = check(
            "metadata",
            &[("WARC-Warcinfo-ID", "<urn:a>"), ("WARC-Warcinfo-ID", "<urn:b>")],
        );
        assert_eq!(violations, vec!["Field must not be repeated: WARC-Warcinfo-ID"]);
    }

    #[test]
    fn concurrent_to_is_repeatable_but_forbidden_on_warcinfo() {
        let ok = check(
            "metadata",
            &[("WARC-Concurrent-To", "<urn:a>"), ("WARC-Concurrent-To", "<urn:b>")],
        );
        assert!(ok.is_empty(), "{:?}", ok);

        let violations = check("warcinfo", &[("WARC-Concurrent-To", "<urn:a>")]);
        assert_eq!(
            violations,
            vec!["Field not allowed on warcinfo record: WARC-Concurrent-To"]
        );
    }

    #[test]
    fn invalid_values_flagged() {
        let violations = check("metadata", &[("Content-Type", "not a media type")]);
        assert_eq!(violations, vec!["Field has invalid value: not a media type"]);

        let violations = check("metadata", &[("WARC-Segment-Number", "-1")]);
        assert_eq!(violations, vec!["Field has invalid value: -1"]);
    }

    #[test]
    fn revisit_requires_profile() {
        let violations = check("revisit", &[("WARC-Target-URI", "http://example.org/")]);
        assert_eq!(
            violations,
            vec!["Missing mandatory field for revisit record: WARC-Profile"]
        );
    }

    #[test]
    fn digest_value_admits_base64_characters() {
        let ok = check(
            "metadata",
            &[("WARC-Block-Digest", "sha1:Kq5sNclPz7QV2+lfQIuc6R7oRu0=")],
        );
        assert!(ok.is_empty(), "{:?}", ok);
    }

    #[test]
    fn unknown_fields_only_with_extensions_forbidden() {
        let mut fields = minimal("metadata");
        fields.push(("WARC-Custom-Thing", "x".to_string()));
        let slices: Vec<(&str, &str)> = fields.iter().map(|(n, v)| (*n, v.as_str())).collect();
        let h = headers(&slices);
        assert!(HeaderValidator::warc_1_1(false).validate(&h).is_empty());
        assert_eq!(
            HeaderValidator::warc_1_1(true).validate(&h),
            vec!["Unknown field: WARC-Custom-Thing"]
        );
    }

    #[test]
    fn warc_1_0_rejects_subsecond_date() {
        let mut fields = minimal("metadata");
        fields[3].1 = "2016-09-19T17:20:24.123Z".to_string();
        let slices: Vec<(&str, &str)> = fields.iter().map(|(n, v)| (*n, v.as_str())).collect();
        let h = headers(&slices);
        assert!(HeaderValidator::warc_1_1(false).validate(&h).is_empty());
        assert_eq!(
            HeaderValidator::warc_1_0(false).validate(&h),
            vec!["Field has invalid value: 2016-09-19T17:20:24.123Z"]
        );
    }

    #[test]
    fn continuation_requires_segment_origin() {
        let violations = check("continuation", &[("WARC-Target-URI", "http://example.org/")]);
        assert_eq!(
            violations,
            vec!["Missing mandatory field for continuation record: WARC-Segment-Origin-ID"]
        );
    }
}
