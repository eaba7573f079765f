// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Translate the wire-agnostic [`PublishProperties`]/header list into
//! `lapin`'s `BasicProperties`/`FieldTable`.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::BasicProperties;
use samwise_wire::protocol::PublishProperties;

pub fn to_basic_properties(props: &PublishProperties, headers: &[(String, String)]) -> BasicProperties {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    let mut out = BasicProperties::default().with_headers(table);
    if let Some(v) = &props.content_type {
        out = out.with_content_type(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.content_encoding {
        out = out.with_content_encoding(ShortString::from(v.clone()));
    }
    if let Some(v) = props.delivery_mode.as_deref().and_then(|s| s.parse::<u8>().ok()) {
        out = out.with_delivery_mode(v);
    }
    if let Some(v) = props.priority.as_deref().and_then(|s| s.parse::<u8>().ok()) {
        out = out.with_priority(v);
    }
    if let Some(v) = &props.correlation_id {
        out = out.with_correlation_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.reply_to {
        out = out.with_reply_to(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.expiration {
        out = out.with_expiration(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.message_id {
        out = out.with_message_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.kind {
        out = out.with_kind(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.user_id {
        out = out.with_user_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.app_id {
        out = out.with_app_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.cluster_id {
        out = out.with_cluster_id(ShortString::from(v.clone()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_properties_produce_only_the_headers_table() {
        let props = PublishProperties::default();
        let built = to_basic_properties(&props, &[("x-trace".to_string(), "abc".to_string())]);
        assert!(built.content_type().is_none());
        assert!(built.headers().is_some());
    }

    #[test]
    fn delivery_mode_and_priority_parse_as_numbers() {
        let props = PublishProperties {
            delivery_mode: Some("2".to_string()),
            priority: Some("5".to_string()),
            ..Default::default()
        };
        let built = to_basic_properties(&props, &[]);
        assert_eq!(built.delivery_mode(), &Some(2));
        assert_eq!(built.priority(), &Some(5));
    }
}
