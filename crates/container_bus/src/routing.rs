//! Exchange names, routing keys and the message kinds containers exchange
//! with the orchestrator.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Point-to-point exchange shared by one-way sends and RPC requests.
pub const DIRECT_EXCHANGE: &str = "mythic_exchange";
/// Fan-out exchange for broadcast notifications.
pub const TOPIC_EXCHANGE: &str = "mythic_topic_exchange";
/// The broker's nameless exchange, routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";
/// Pseudo-queue used for RPC replies without declaring a queue per call.
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
}

impl ExchangeKind {
    pub fn exchange_name(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => DIRECT_EXCHANGE,
            ExchangeKind::Topic => TOPIC_EXCHANGE,
        }
    }
}

/// Deterministic queue/routing-key name for a container's message kind,
/// e.g. `apfell_payload_build`.
pub fn queue_name(container_name: &str, message_kind: &str) -> String {
    format!("{container_name}_{message_kind}")
}

/// Matches an AMQP topic binding pattern against a routing key.
///
/// `*` matches exactly one dot-separated word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((word, rest)) => match key.split_first() {
            Some((k, key_rest)) if *word == "*" || word == k => match_words(rest, key_rest),
            _ => false,
        },
    }
}

/// Message kinds a container registers handlers for. The queue and routing
/// key are `queue_name(container, kind)`.
pub mod kinds {
    pub const PAYLOAD_BUILD: &str = "payload_build";
    pub const PT_TASK_CREATE_TASKING: &str = "pt_task_create_tasking";
    pub const PT_TASK_PROCESS_RESPONSE: &str = "pt_task_process_response";
    pub const PT_TASK_OPSEC_PRE_CHECK: &str = "pt_task_opsec_pre_check";
    pub const PT_TASK_COMPLETION_FUNCTION: &str = "pt_task_completion_function";
    pub const PT_RPC_DYNAMIC_QUERY_FUNCTION: &str = "pt_rpc_dynamic_query_function";
    pub const C2_RPC_OPSEC_CHECK: &str = "c2_rpc_opsec_check";
    pub const C2_RPC_CONFIG_CHECK: &str = "c2_rpc_config_check";
    pub const C2_RPC_START_SERVER: &str = "c2_rpc_start_server";
    pub const C2_RPC_STOP_SERVER: &str = "c2_rpc_stop_server";
    pub const C2_RPC_GET_IOC: &str = "c2_rpc_get_ioc";
    pub const TR_RPC_ENCRYPT_BYTES: &str = "tr_rpc_encrypt_bytes";
    pub const TR_RPC_DECRYPT_BYTES: &str = "tr_rpc_decrypt_bytes";
    pub const AUTH_RPC_GET_IDP_METADATA: &str = "auth_rpc_get_idp_metadata";
    pub const EVENTING_CUSTOM_FUNCTION: &str = "eventing_custom_function";
}

/// Routing keys the orchestrator listens on directly (not container scoped).
pub mod orchestrator {
    pub const PT_SYNC: &str = "pt_sync";
    pub const C2_SYNC: &str = "c2_sync";
    pub const TR_SYNC: &str = "tr_sync";
    pub const CONTAINER_ON_START: &str = "container_on_start";
    pub const PAYLOAD_BUILD_RESPONSE: &str = "pt_build_response";
}

/// Topic-exchange routing keys used for one-to-many notifications.
pub mod topics {
    pub const LOG_NEW_CALLBACK: &str = "emit_log.new_callback";
    pub const LOG_NEW_ARTIFACT: &str = "emit_log.new_artifact";
    pub const LOG_NEW_TASK: &str = "emit_log.new_task";
    pub const LOG_NEW_CREDENTIAL: &str = "emit_log.new_credential";
    pub const WEBHOOK_NEW_CALLBACK: &str = "emit_webhook.new_callback";
    pub const WEBHOOK_NEW_FEEDBACK: &str = "emit_webhook.new_feedback";
    pub const WEBHOOK_NEW_STARTUP: &str = "emit_webhook.new_startup";
    pub const EVENTING_NEW_EVENT: &str = "emit_eventing.new_event";
}
