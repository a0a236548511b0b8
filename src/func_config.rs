//! Function registry loaded at startup and immutable afterwards.
//!
//! The config file is a JSON array of entries. gRPC services are listed
//! under the name `grpc:<service>` with their unary methods enumerated;
//! a method's id is its index in that list.
//!
//! ```json
//! [
//!   {"funcName": "echo", "funcId": 1},
//!   {"funcName": "grpc:svc", "funcId": 2, "grpcMethods": ["Foo", "Bar"]}
//! ]
//! ```

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

/// `func_id` must fit the 8-bit slot of the packed call id.
pub const MAX_FUNC_ID: u16 = 255;

/// Method ids must fit the 8-bit method slot.
pub const MAX_GRPC_METHODS: usize = 256;

pub const GRPC_FUNC_NAME_PREFIX: &str = "grpc:";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FuncEntry {
    pub func_name: String,
    pub func_id: u16,
    #[serde(default)]
    pub grpc_methods: Vec<String>,
    #[serde(default)]
    pub min_workers: Option<u32>,
    #[serde(default)]
    pub max_workers: Option<u32>,
}

impl FuncEntry {
    pub fn is_grpc_service(&self) -> bool {
        self.func_name.starts_with(GRPC_FUNC_NAME_PREFIX)
    }
}

#[derive(Debug, Error)]
pub enum FuncConfigError {
    #[error("invalid function config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("function entry has an empty name")]
    EmptyName,
    #[error("func_id {0} is out of range 1..={MAX_FUNC_ID}")]
    FuncIdOutOfRange(u16),
    #[error("duplicate func_id {0}")]
    DuplicateFuncId(u16),
    #[error("duplicate function name {0:?}")]
    DuplicateFuncName(String),
    #[error("function {0:?} declares more than {MAX_GRPC_METHODS} gRPC methods")]
    TooManyGrpcMethods(String),
    #[error("function {0:?} declares duplicate gRPC method {1:?}")]
    DuplicateGrpcMethod(String, String),
    #[error("function {0:?} declares gRPC methods but is not named grpc:<service>")]
    GrpcMethodsOnPlainFunction(String),
}

pub struct FuncConfig {
    entries: Vec<FuncEntry>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<u16, usize>,
}

impl FuncConfig {
    pub fn load(json: &str) -> Result<Self, FuncConfigError> {
        let entries: Vec<FuncEntry> = serde_json::from_str(json)?;
        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();
        for (index, entry) in entries.iter().enumerate() {
            if entry.func_name.is_empty() {
                return Err(FuncConfigError::EmptyName);
            }
            if entry.func_id == 0 || entry.func_id > MAX_FUNC_ID {
                return Err(FuncConfigError::FuncIdOutOfRange(entry.func_id));
            }
            if entry.grpc_methods.len() > MAX_GRPC_METHODS {
                return Err(FuncConfigError::TooManyGrpcMethods(entry.func_name.clone()));
            }
            if !entry.grpc_methods.is_empty() && !entry.is_grpc_service() {
                return Err(FuncConfigError::GrpcMethodsOnPlainFunction(
                    entry.func_name.clone(),
                ));
            }
            for (i, method) in entry.grpc_methods.iter().enumerate() {
                if entry.grpc_methods[..i].contains(method) {
                    return Err(FuncConfigError::DuplicateGrpcMethod(
                        entry.func_name.clone(),
                        method.clone(),
                    ));
                }
            }
            if by_name.insert(entry.func_name.clone(), index).is_some() {
                return Err(FuncConfigError::DuplicateFuncName(entry.func_name.clone()));
            }
            if by_id.insert(entry.func_id, index).is_some() {
                return Err(FuncConfigError::DuplicateFuncId(entry.func_id));
            }
        }
        Ok(Self {
            entries,
            by_name,
            by_id,
        })
    }

    pub fn find_by_func_name(&self, name: &str) -> Option<&FuncEntry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    pub fn find_by_func_id(&self, func_id: u16) -> Option<&FuncEntry> {
        self.by_id.get(&func_id).map(|&i| &self.entries[i])
    }

    /// Resolves a gRPC (service, method) pair to (func_id, method_id).
    pub fn find_grpc(&self, service: &str, method: &str) -> Option<(u16, u16)> {
        let entry = self.find_by_func_name(&format!("{GRPC_FUNC_NAME_PREFIX}{service}"))?;
        entry
            .grpc_methods
            .iter()
            .position(|m| m == method)
            .map(|i| (entry.func_id, i as u16))
    }

    pub fn entries(&self) -> &[FuncEntry] {
        &self.entries
    }
}
