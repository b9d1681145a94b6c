// ABOUTME: Test helper module declarations
// ABOUTME: Exposes the axum request helper used by route integration tests
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

#![allow(dead_code)]

pub mod axum_test;
