// ABOUTME: Cryptographic utilities module
// ABOUTME: Re-exports the key vault sealing stored provider secrets
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! Cryptographic utilities and key management

/// Master-key vault sealing stored upstream provider API keys
pub mod keys;

pub use keys::KeyVault;
