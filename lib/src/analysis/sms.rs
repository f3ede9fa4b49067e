//! Silent and binary SMS classification.
//!
//! Silent ("Type 0") and flash ("Class 0") messages are the classic way of
//! pinging a handset's location without the owner noticing. Each rule below
//! is checked independently, so one message can match several.

use std::borrow::Cow;

use super::analyzer::{AnomalyEvent, AnomalyKind, Classifier};
use crate::observation::{PROTOCOL_ID_TYPE_0, SmsObservation, WapPushObservation};

struct SmsRule {
    kind: AnomalyKind,
    matches: fn(&SmsObservation) -> bool,
    detail: &'static str,
}

const SMS_RULES: &[SmsRule] = &[
    SmsRule {
        kind: AnomalyKind::SilentSmsClass0,
        matches: |sms| sms.message_class == Some(0),
        detail: "message class 0 (flash, not stored)",
    },
    SmsRule {
        kind: AnomalyKind::SilentSmsType0,
        matches: |sms| sms.protocol_id == Some(PROTOCOL_ID_TYPE_0),
        detail: "protocol identifier 0x40 (silent delivery)",
    },
    SmsRule {
        kind: AnomalyKind::BinarySms,
        matches: |sms| !sms.has_text_body && sms.has_binary_payload,
        detail: "binary payload without a text body",
    },
];

fn sender_label(sender: Option<&str>) -> &str {
    sender.unwrap_or("unknown sender")
}

/// Every rule the message matches, in rule order.
pub fn classify_sms(sms: &SmsObservation) -> Vec<AnomalyEvent> {
    SMS_RULES
        .iter()
        .filter(|rule| (rule.matches)(sms))
        .map(|rule| {
            AnomalyEvent::new(
                rule.kind,
                sms.received_at,
                format!(
                    "{} from {}: {}",
                    rule.kind.title(),
                    sender_label(sms.sender.as_deref()),
                    rule.detail
                ),
            )
        })
        .collect()
}

/// WAP push deliveries arrive on their own intake path and are always
/// reported.
pub fn classify_wap_push(push: &WapPushObservation) -> AnomalyEvent {
    AnomalyEvent::new(
        AnomalyKind::WapPush,
        push.received_at,
        format!("WAP push received from {}", sender_label(push.sender.as_deref())),
    )
}

#[derive(Default)]
pub struct SmsClassifier;

impl Classifier for SmsClassifier {
    fn get_name(&self) -> Cow<'_, str> {
        Cow::from("Silent SMS")
    }

    fn get_description(&self) -> Cow<'_, str> {
        Cow::from(
            "Flags Class 0 (flash) and Type 0 (silent) short messages, binary-only SMS and \
             WAP push deliveries, all of which can confirm a handset's presence without the \
             user seeing anything. Carrier configuration messages are a common benign source.",
        )
    }

    fn get_version(&self) -> u32 {
        1
    }
}
