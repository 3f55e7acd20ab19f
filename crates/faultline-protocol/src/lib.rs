// Copyright (c) 2026 Faultline Contributors
// SPDX-License-Identifier: Apache-2.0

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
#![forbid(unsafe_code)]

use prost::Message;
use thiserror::Error;

pub mod pb {
    pub mod v2 {
        tonic::include_proto!("faultline.runtime.v2");
    }

    pub mod v3 {
        tonic::include_proto!("faultline.runtime.v3");
    }

    pub mod chaos {
        tonic::include_proto!("faultline.chaos.v1");
    }

    pub use v3::*;
}

pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

pub const RUNTIME_TYPE_URL_V2: &str = "type.googleapis.com/faultline.runtime.v2.Runtime";
pub const RUNTIME_TYPE_URL_V3: &str = "type.googleapis.com/faultline.runtime.v3.Runtime";
pub const RESOURCE_TYPE_URL_V2: &str = "type.googleapis.com/faultline.runtime.v2.Resource";
pub const RESOURCE_TYPE_URL_V3: &str = "type.googleapis.com/faultline.runtime.v3.Resource";

pub const INGRESS_FAULT_TYPE_URL: &str = "type.googleapis.com/faultline.chaos.v1.IngressFaultConfig";
pub const EGRESS_FAULT_TYPE_URL: &str = "type.googleapis.com/faultline.chaos.v1.EgressFaultConfig";

#[derive(Debug, Error)]
pub enum AnyError {
    #[error("type URL mismatch: expected `{expected}`, got `{actual}`")]
    TypeUrlMismatch { expected: String, actual: String },
    #[error("failed to decode `{type_url}` payload: {source}")]
    Decode {
        type_url: String,
        source: prost::DecodeError,
    },
}

/// Packs `message` into an `Any` under an explicit type URL.
///
/// The type URL is a parameter rather than derived from the message type so
/// that byte-compatible wire revisions (v2/v3) can share one in-memory
/// representation.
pub fn pack_message<M: Message>(type_url: &str, message: &M) -> prost_types::Any {
    prost_types::Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}

pub fn unpack_message<M: Message + Default>(
    any: &prost_types::Any,
    expected_type_url: &str,
) -> Result<M, AnyError> {
    if any.type_url != expected_type_url {
        return Err(AnyError::TypeUrlMismatch {
            expected: expected_type_url.to_string(),
            actual: any.type_url.clone(),
        });
    }
    M::decode(any.value.as_slice()).map_err(|source| AnyError::Decode {
        type_url: any.type_url.clone(),
        source,
    })
}
