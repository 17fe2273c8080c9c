//! Property-based tests for the topic model and frame routing
//!
//! Every event type must survive build-then-parse with and without a
//! sub-type, and parsing must reject anything outside the closed vocabulary.

use proptest::prelude::*;
use pulsechat_core::frame::{self, Frame, Route};
use pulsechat_core::{AccountId, EventType, SubType, Topic, TopicError};

fn arb_account() -> impl Strategy<Value = AccountId> {
    "[A-Za-z0-9_.-]{1,24}".prop_map(|s| AccountId::new(s).unwrap())
}

fn arb_event() -> impl Strategy<Value = EventType> {
    prop::sample::select(EventType::ALL.to_vec())
}

fn arb_sub() -> impl Strategy<Value = Option<SubType>> {
    prop::option::of(prop::sample::select(SubType::ALL.to_vec()))
}

// ----------------------------------------------------------------------------
// Topic Round Trip
// ----------------------------------------------------------------------------

#[test]
fn test_every_event_type_round_trips() {
    let account = AccountId::new("acc-1").unwrap();
    for event in EventType::ALL {
        let plain = Topic::new(account.clone(), event);
        assert_eq!(Topic::parse(&plain.to_string()).unwrap(), plain);

        for sub in SubType::ALL {
            let with_sub = Topic::with_sub(account.clone(), event, sub);
            assert_eq!(Topic::parse(&with_sub.to_string()).unwrap(), with_sub);
        }
    }
}

proptest! {
    #[test]
    fn prop_topic_round_trip(account in arb_account(), event in arb_event(), sub in arb_sub()) {
        let topic = Topic { account, event, sub };
        let text = topic.to_string();
        prop_assert!(text.starts_with("ns:"));
        prop_assert_eq!(Topic::parse(&text).unwrap(), topic);
    }

    #[test]
    fn prop_unknown_event_types_rejected(account in arb_account(), event in "[a-z_]{1,20}") {
        prop_assume!(EventType::ALL.iter().all(|e| e.as_str() != event));
        let text = format!("ns:{account}:{event}");
        let is_unknown = matches!(Topic::parse(&text), Err(TopicError::UnknownEventType { .. }));
        prop_assert!(is_unknown);
    }

    #[test]
    fn prop_parse_is_total(text in "\\PC{0,64}") {
        // Must return, never panic
        let _ = Topic::parse(&text);
    }
}

// ----------------------------------------------------------------------------
// Frame Routing
// ----------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_frame_header_round_trip(cmd in any::<u16>(), sub_cmd in any::<u8>(), n in any::<i64>()) {
        let frame = Frame::new(cmd, sub_cmd, serde_json::json!({"n": n}));
        prop_assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn prop_routing_is_total(cmd in any::<u16>(), sub_cmd in any::<u8>()) {
        let route = frame::route(cmd, sub_cmd);
        if let Route::Event { event, .. } = route {
            prop_assert!(EventType::ALL.contains(&event));
        }
    }
}
