/*!
 * Table-driven response parser.
 *
 * A response is classified by the first rule whose marker substring it
 * contains, then each extraction of that rule pulls the text between a
 * start and end delimiter and maps it onto a telemetry field. Parsing
 * never fails: an unmatched marker yields no updates, and missing
 * delimiters yield an empty value that only a lock fallback turns into an
 * update.
 */
use crate::telemetry::{DeviceField, FieldUpdate, LockState};

/// How extracted text becomes a field value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Use the extracted text as-is
    Identity,
    /// Map the extracted text onto a lock state
    Lock {
        /// Recognized status strings
        mapping: &'static [(&'static str, LockState)],
        /// State for unrecognized or empty text; `None` leaves the field unchanged
        fallback: Option<LockState>,
    },
}

impl Transform {
    fn apply(&self, field: DeviceField, text: &str) -> Option<FieldUpdate> {
        match self {
            Transform::Identity if text.is_empty() => None,
            Transform::Identity => Some(FieldUpdate::text(field, text)),
            Transform::Lock { mapping, fallback } => mapping
                .iter()
                .find(|(status, _)| *status == text)
                .map(|(_, state)| *state)
                .or(*fallback)
                .map(|state| FieldUpdate::lock(field, state)),
        }
    }
}

/// One delimiter pair mapped onto a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extraction {
    /// Text preceding the value
    pub start: &'static str,
    /// Text following the value
    pub end: &'static str,
    /// Target field
    pub field: DeviceField,
    /// Value mapping
    pub transform: Transform,
}

/// A marker and the extractions it selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerRule {
    /// Substring identifying the response kind
    pub marker: &'static str,
    /// Extractions applied when the marker is present
    pub extractions: &'static [Extraction],
}

const REACTIVE_STATUS: &[(&str, LockState)] = &[
    ("TRIGGERED", LockState::Locked),
    ("LOCK", LockState::Locked),
    ("NG(-2)", LockState::Unlocked),
    ("UNLOCK", LockState::Unlocked),
];

const NETWORK_STATUS: &[(&str, LockState)] = &[("LOCK", LockState::Locked)];

/// Marker rules for the supported device responses, in match order
pub static DEFAULT_RULES: &[MarkerRule] = &[
    MarkerRule {
        marker: "+DEVCONINFO",
        extractions: &[
            Extraction {
                start: "IMEI(",
                end: ");",
                field: DeviceField::Imei,
                transform: Transform::Identity,
            },
            Extraction {
                start: "SN(",
                end: ");",
                field: DeviceField::SerialNo,
                transform: Transform::Identity,
            },
            Extraction {
                start: "PRD(",
                end: ");",
                field: DeviceField::Carrier,
                transform: Transform::Identity,
            },
            Extraction {
                start: "MN(",
                end: ");",
                field: DeviceField::ModelNo,
                transform: Transform::Identity,
            },
        ],
    },
    MarkerRule {
        marker: "+REACTIVE",
        extractions: &[Extraction {
            start: "\n+REACTIVE:1,",
            end: "\r\n",
            field: DeviceField::ActivationLock,
            transform: Transform::Lock { mapping: REACTIVE_STATUS, fallback: None },
        }],
    },
    MarkerRule {
        marker: "+VERSNAME",
        extractions: &[Extraction {
            start: "NAME:3,",
            end: "OK",
            field: DeviceField::AndroidVersion,
            transform: Transform::Identity,
        }],
    },
    MarkerRule {
        marker: "+SVCIFPGM",
        extractions: &[Extraction {
            start: "4,",
            end: ",OK",
            field: DeviceField::NetworkLock,
            transform: Transform::Lock {
                mapping: NETWORK_STATUS,
                fallback: Some(LockState::Unlocked),
            },
        }],
    },
];

/// Text strictly between the first `start` and the first `end` after it
///
/// Returns an empty string when either delimiter is missing.
pub fn extract_between<'a>(text: &'a str, start: &str, end: &str) -> &'a str {
    let Some(start_idx) = text.find(start) else {
        return "";
    };
    let from = start_idx + start.len();
    match text[from..].find(end) {
        Some(len) => &text[from..from + len],
        None => "",
    }
}

/// Result of parsing one response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Marker of the rule that matched
    pub marker: Option<&'static str>,
    /// Field updates, in extraction order
    pub updates: Vec<FieldUpdate>,
}

impl ParsedResponse {
    /// Whether the response matched a rule
    pub fn is_recognized(&self) -> bool {
        self.marker.is_some()
    }
}

/// Parser over a fixed rule table
#[derive(Debug, Clone, Copy)]
pub struct ResponseParser {
    rules: &'static [MarkerRule],
}

impl ResponseParser {
    /// Parser with the built-in rules
    pub fn new() -> Self {
        Self::with_rules(DEFAULT_RULES)
    }

    /// Parser with a custom rule table
    pub fn with_rules(rules: &'static [MarkerRule]) -> Self {
        Self { rules }
    }

    /// Rules in match order
    pub fn rules(&self) -> &'static [MarkerRule] {
        self.rules
    }

    /// Classify a response and extract field updates
    ///
    /// Extracted values are trimmed of surrounding whitespace before they
    /// are transformed, so `+VERSNAME:3,11\r\nOK` yields `11` rather than
    /// `11\r\n`. An empty value never produces a text update.
    pub fn parse(&self, text: &str) -> ParsedResponse {
        let Some(rule) = self.rules.iter().find(|rule| text.contains(rule.marker)) else {
            return ParsedResponse::default();
        };

        let updates = rule
            .extractions
            .iter()
            .filter_map(|extraction| {
                let value = extract_between(text, extraction.start, extraction.end).trim();
                extraction.transform.apply(extraction.field, value)
            })
            .collect();

        ParsedResponse { marker: Some(rule.marker), updates }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::DeviceInfo;

    fn parse_into(text: &str) -> (ParsedResponse, DeviceInfo) {
        let parsed = ResponseParser::new().parse(text);
        let mut info = DeviceInfo::new("COM1");
        info.apply(&parsed.updates);
        (parsed, info)
    }

    #[test]
    fn test_extract_between() {
        assert_eq!(extract_between("a IMEI(42); b", "IMEI(", ");"), "42");
        assert_eq!(extract_between("IMEI(42", "IMEI(", ");"), "");
        assert_eq!(extract_between("no start", "IMEI(", ");"), "");
        // end delimiter is searched only after the start delimiter
        assert_eq!(extract_between(");IMEI(7);", "IMEI(", ");"), "7");
        assert_eq!(extract_between("IMEI();", "IMEI(", ");"), "");
    }

    #[test]
    fn test_devconinfo() {
        let text = "AT+DEVCONINFO\r\n+DEVCONINFO: MN(ModelX);BASE(X);VER(Y);\
                    PRD(Carrier);SN(ABC1);IMEI(123456789012345);\r\n\r\nOK\r\n";
        let (parsed, info) = parse_into(text);
        assert_eq!(parsed.marker, Some("+DEVCONINFO"));
        assert_eq!(info.imei.as_deref(), Some("123456789012345"));
        assert_eq!(info.serial_no.as_deref(), Some("ABC1"));
        assert_eq!(info.carrier.as_deref(), Some("Carrier"));
        assert_eq!(info.model_no.as_deref(), Some("ModelX"));
        assert_eq!(info.activation_lock, LockState::Unknown);
        assert_eq!(info.android_version, None);
        assert_eq!(parsed.updates.len(), 4);
    }

    #[test]
    fn test_devconinfo_partial_response() {
        let (parsed, info) = parse_into("+DEVCONINFO: IMEI(123);SN(AB");
        assert_eq!(parsed.updates, vec![FieldUpdate::text(DeviceField::Imei, "123")]);
        assert_eq!(info.serial_no, None);
    }

    #[test]
    fn test_reactive_statuses() {
        let cases = [
            ("LOCK", Some(LockState::Locked)),
            ("TRIGGERED", Some(LockState::Locked)),
            ("UNLOCK", Some(LockState::Unlocked)),
            ("NG(-2)", Some(LockState::Unlocked)),
            ("PENDING", None),
        ];
        for (status, expected) in cases {
            let text = format!("AT+REACTIVE=1,0,0\r\n+REACTIVE:1,{}\r\n\r\nOK\r\n", status);
            let parsed = ResponseParser::new().parse(&text);
            assert_eq!(parsed.marker, Some("+REACTIVE"));
            let expected: Vec<_> = expected
                .map(|state| FieldUpdate::lock(DeviceField::ActivationLock, state))
                .into_iter()
                .collect();
            assert_eq!(parsed.updates, expected, "status {}", status);
        }
    }

    #[test]
    fn test_reactive_without_status_leaves_field_unchanged() {
        let parsed = ResponseParser::new().parse("+REACTIVE:ERROR\r\n");
        assert_eq!(parsed.marker, Some("+REACTIVE"));
        assert!(parsed.updates.is_empty());
    }

    #[test]
    fn test_reactive_unknown_status_leaves_field_unchanged() {
        let mut info = DeviceInfo::new("COM1");
        info.activation_lock = LockState::Locked;
        let parsed = ResponseParser::new().parse("\n+REACTIVE:1,WHATEVER\r\n");
        assert!(info.apply(&parsed.updates).is_empty());
        assert_eq!(info.activation_lock, LockState::Locked);
    }

    #[test]
    fn test_versname() {
        let (_, info) = parse_into("AT+VERSNAME=3,2,3\r\n+VERSNAME:3,11\r\nOK\r\n");
        assert_eq!(info.android_version.as_deref(), Some("11"));
    }

    #[test]
    fn test_svcifpgm() {
        let (_, locked) = parse_into("+SVCIFPGM:1,4,LOCK,OK");
        assert_eq!(locked.network_lock, LockState::Locked);

        let (_, free) = parse_into("+SVCIFPGM:1,4,FREE,OK");
        assert_eq!(free.network_lock, LockState::Unlocked);

        // missing delimiters count as "not LOCK"
        let (parsed, missing) = parse_into("+SVCIFPGM:ERROR\r\n");
        assert_eq!(
            parsed.updates,
            vec![FieldUpdate::lock(DeviceField::NetworkLock, LockState::Unlocked)]
        );
        assert_eq!(missing.network_lock, LockState::Unlocked);
    }

    #[test]
    fn test_unrecognized_response() {
        let parsed = ResponseParser::new().parse("AT\r\nOK\r\n");
        assert!(!parsed.is_recognized());
        assert!(parsed.updates.is_empty());
        assert!(!ResponseParser::new().parse("").is_recognized());
    }

    #[test]
    fn test_first_rule_wins() {
        // both markers present: the earlier rule is used exclusively
        let text = "+DEVCONINFO: IMEI(1);\n+REACTIVE:1,LOCK\r\n";
        let parsed = ResponseParser::new().parse(text);
        assert_eq!(parsed.marker, Some("+DEVCONINFO"));
        assert!(parsed
            .updates
            .iter()
            .all(|update| update.field != DeviceField::ActivationLock));
    }

    #[test]
    fn test_custom_rules() {
        static RULES: &[MarkerRule] = &[MarkerRule {
            marker: "+STORAGE",
            extractions: &[Extraction {
                start: "SIZE:",
                end: "\r\n",
                field: DeviceField::StorageSize,
                transform: Transform::Identity,
            }],
        }];
        let parser = ResponseParser::with_rules(RULES);
        let parsed = parser.parse("+STORAGE SIZE: 128GB\r\n");
        assert_eq!(
            parsed.updates,
            vec![FieldUpdate::text(DeviceField::StorageSize, "128GB")]
        );
        assert!(!parser.parse("+DEVCONINFO: IMEI(1);").is_recognized());
    }

    #[test]
    fn test_every_rule_has_extractions() {
        for rule in DEFAULT_RULES {
            assert!(!rule.extractions.is_empty(), "{}", rule.marker);
        }
    }
}
