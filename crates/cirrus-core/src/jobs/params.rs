// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed job parameters.
//!
//! Parameters are a map from a closed set of keys to scalar values, stored as
//! JSON on the job row so a job can be rebuilt and rerun on another node.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Every parameter key a handler may accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKey {
    /// Host the operation runs on.
    HostId,
    /// Destination host of a migration.
    TargetHostId,
    /// Agent timeout for each command, in seconds.
    TimeoutSecs,
    /// Skip graceful shutdown.
    Force,
    /// Free-form reason recorded with the operation.
    Reason,
}

impl ParamKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostId => "host_id",
            Self::TargetHostId => "target_host_id",
            Self::TimeoutSecs => "timeout_secs",
            Self::Force => "force",
            Self::Reason => "reason",
        }
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

fn invalid(key: ParamKey, message: impl Into<String>) -> CoreError {
    CoreError::Validation {
        field: key.as_str().to_string(),
        message: message.into(),
    }
}

/// Parameters of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParams(BTreeMap<ParamKey, ParamValue>);

impl JobParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: ParamKey, value: impl Into<ParamValue>) -> Self {
        self.0.insert(key, value.into());
        self
    }

    pub fn insert(&mut self, key: ParamKey, value: impl Into<ParamValue>) {
        self.0.insert(key, value.into());
    }

    pub fn get(&self, key: ParamKey) -> Option<&ParamValue> {
        self.0.get(&key)
    }

    pub fn contains(&self, key: ParamKey) -> bool {
        self.0.contains_key(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = ParamKey> + '_ {
        self.0.keys().copied()
    }

    pub fn int(&self, key: ParamKey) -> Result<Option<i64>, CoreError> {
        match self.0.get(&key) {
            None => Ok(None),
            Some(ParamValue::Int(v)) => Ok(Some(*v)),
            Some(_) => Err(invalid(key, "expected an integer")),
        }
    }

    pub fn bool(&self, key: ParamKey) -> Result<Option<bool>, CoreError> {
        match self.0.get(&key) {
            None => Ok(None),
            Some(ParamValue::Bool(v)) => Ok(Some(*v)),
            Some(_) => Err(invalid(key, "expected a boolean")),
        }
    }

    pub fn str(&self, key: ParamKey) -> Result<Option<&str>, CoreError> {
        match self.0.get(&key) {
            None => Ok(None),
            Some(ParamValue::Str(v)) => Ok(Some(v.as_str())),
            Some(_) => Err(invalid(key, "expected a string")),
        }
    }

    pub fn require_int(&self, key: ParamKey) -> Result<i64, CoreError> {
        self.int(key)?.ok_or_else(|| invalid(key, "required parameter missing"))
    }

    /// Reject missing required keys and keys the handler does not know.
    pub fn validate(&self, required: &[ParamKey], optional: &[ParamKey]) -> Result<(), CoreError> {
        if let Some(missing) = required.iter().find(|k| !self.contains(**k)) {
            return Err(invalid(*missing, "required parameter missing"));
        }
        if let Some(unknown) = self
            .keys()
            .find(|k| !required.contains(k) && !optional.contains(k))
        {
            return Err(invalid(unknown, "parameter not accepted by this operation"));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        serde_json::from_str(json).map_err(|e| CoreError::Validation {
            field: "params".to_string(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_uses_snake_case_keys() {
        let params = JobParams::new()
            .with(ParamKey::HostId, 7)
            .with(ParamKey::Force, true)
            .with(ParamKey::Reason, "maintenance");
        let json = params.to_json().unwrap();
        assert_eq!(json, r#"{"host_id":7,"force":true,"reason":"maintenance"}"#);
        assert_eq!(JobParams::from_json(&json).unwrap(), params);
    }

    #[test]
    fn test_validate_missing_and_unknown() {
        let required = [ParamKey::HostId];
        let optional = [ParamKey::TimeoutSecs];

        let err = JobParams::new().validate(&required, &optional).unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "host_id"));

        let err = JobParams::new()
            .with(ParamKey::HostId, 1)
            .with(ParamKey::TargetHostId, 2)
            .validate(&required, &optional)
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "target_host_id"));

        JobParams::new()
            .with(ParamKey::HostId, 1)
            .with(ParamKey::TimeoutSecs, 30)
            .validate(&required, &optional)
            .unwrap();
    }

    #[test]
    fn test_typed_access_rejects_wrong_type() {
        let params = JobParams::new().with(ParamKey::HostId, "seven");
        assert!(params.int(ParamKey::HostId).is_err());
        assert_eq!(params.str(ParamKey::HostId).unwrap(), Some("seven"));
        assert_eq!(params.int(ParamKey::TargetHostId).unwrap(), None);
    }

    #[test]
    fn test_unknown_key_in_json_is_rejected() {
        assert!(JobParams::from_json(r#"{"flavour":"large"}"#).is_err());
    }
}
