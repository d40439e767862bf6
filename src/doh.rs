// Copyright (c) 2024, The QuicFuscate Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! # DNS-over-HTTPS Module
//!
//! Resolves hostnames via a DoH provider's JSON API instead of plaintext
//! DNS, so resolution itself doesn't leak the destination to an observer
//! watching UDP/53.

use crate::error::{NetworkError, QuicFuscateError, Result};
use reqwest::Client;
use std::net::IpAddr;
use url::Url;

/// Resolves `domain` to an `A` record using `doh_provider`'s DNS-JSON API
/// (e.g. `https://cloudflare-dns.com/dns-query`).
pub async fn resolve(client: &Client, domain: &str, doh_provider: &str) -> Result<IpAddr> {
    let mut url = Url::parse(doh_provider)
        .map_err(|e| QuicFuscateError::Network(NetworkError::DnsFail(e.to_string())))?;
    url.query_pairs_mut()
        .append_pair("name", domain)
        .append_pair("type", "A");

    let resp = client
        .get(url)
        .header("Accept", "application/dns-json")
        .send()
        .await
        .map_err(|e| QuicFuscateError::Network(NetworkError::DnsFail(e.to_string())))?
        .json::<serde_json::Value>()
        .await
        .map_err(|e| QuicFuscateError::Network(NetworkError::DnsFail(e.to_string())))?;

    if let Some(arr) = resp.get("Answer").and_then(|a| a.as_array()) {
        for answer in arr {
            if answer["type"] == 1 {
                if let Some(ip_str) = answer["data"].as_str() {
                    if let Ok(ip) = ip_str.parse() {
                        return Ok(ip);
                    }
                }
            }
        }
    }
    Err(QuicFuscateError::Network(NetworkError::DnsFail(format!(
        "no A record returned for {}",
        domain
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_provider_url() {
        let client = Client::new();
        let result = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(resolve(&client, "example.com", "not a url"));
        assert!(result.is_err());
    }
}
