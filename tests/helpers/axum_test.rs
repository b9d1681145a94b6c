// ABOUTME: Axum HTTP testing utilities for integration tests
// ABOUTME: Drives routers through tower::ServiceExt without binding a socket
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tower::ServiceExt;

/// Request builder executed directly against a router
pub struct AxumTestRequest {
    builder: axum::http::request::Builder,
    body: Body,
}

impl AxumTestRequest {
    fn with_method(method: Method, uri: &str) -> Self {
        Self {
            builder: Request::builder().method(method).uri(uri),
            body: Body::empty(),
        }
    }

    /// Start a GET request
    pub fn get(uri: &str) -> Self {
        Self::with_method(Method::GET, uri)
    }

    /// Start a POST request
    pub fn post(uri: &str) -> Self {
        Self::with_method(Method::POST, uri)
    }

    /// Start a PUT request
    pub fn put(uri: &str) -> Self {
        Self::with_method(Method::PUT, uri)
    }

    /// Start a DELETE request
    pub fn delete(uri: &str) -> Self {
        Self::with_method(Method::DELETE, uri)
    }

    /// Set an arbitrary header
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.builder = self.builder.header(name, value);
        self
    }

    /// Set the `Authorization` header (pass the full `Bearer ...` value)
    pub fn auth(self, value: &str) -> Self {
        self.header("authorization", value)
    }

    /// Attach a JSON body
    pub fn json<T: Serialize>(mut self, payload: &T) -> Self {
        self.builder = self.builder.header("content-type", "application/json");
        self.body = Body::from(serde_json::to_vec(payload).expect("serialize request body"));
        self
    }

    /// Run the request through the router and read the full response
    pub async fn send(self, app: Router) -> AxumTestResponse {
        let request = self.builder.body(self.body).expect("build request");
        let response = app.oneshot(request).await.expect("execute request");

        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read response body")
            .to_vec();

        AxumTestResponse { status, body }
    }
}

/// Captured response: status plus eagerly-read body
pub struct AxumTestResponse {
    status: StatusCode,
    body: Vec<u8>,
}

impl AxumTestResponse {
    /// Response status code
    pub const fn status_code(&self) -> StatusCode {
        self.status
    }

    /// Deserialize the body as JSON
    pub fn json<T: DeserializeOwned>(self) -> T {
        serde_json::from_slice(&self.body).expect("deserialize response body")
    }

    /// Body as UTF-8 text
    pub fn text(self) -> String {
        String::from_utf8(self.body).expect("response body was not UTF-8")
    }
}
