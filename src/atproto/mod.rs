// SPDX-License-Identifier: MPL-2.0

pub mod frames;
pub mod identity;
pub mod records;
pub mod signing;
mod types;

pub use types::{
    DidDocument, InfoMessage, Label, LabelerPolicies, LabelerRecord, LabelsMessage, ServiceEntry,
    VerificationMethod,
};
