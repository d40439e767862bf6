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

//! # Domain Fronting Module
//!
//! Selects the hostname that goes in the SNI/ClientHello while the real
//! destination travels in the HTTP/3 `:authority` pseudo-header instead,
//! so a censor inspecting only the SNI sees an innocuous front domain.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy)]
pub enum CdnProvider {
    Cloudflare,
    Google,
    MicrosoftAzure,
    Akamai,
    Fastly,
}

impl CdnProvider {
    fn domain(&self) -> &'static str {
        match self {
            CdnProvider::Cloudflare => "www.cloudflare.com",
            CdnProvider::Google => "www.google.com",
            CdnProvider::MicrosoftAzure => "azure.microsoft.com",
            CdnProvider::Akamai => "www.akamai.com",
            CdnProvider::Fastly => "www.fastly.com",
        }
    }
}

/// Rotates through a configured list of front domains.
pub struct DomainFronter {
    domains: Vec<String>,
    index: AtomicUsize,
}

impl DomainFronter {
    pub fn new(domains: Vec<String>) -> Self {
        Self { domains, index: AtomicUsize::new(0) }
    }

    pub fn from_providers(providers: Vec<CdnProvider>) -> Self {
        Self::new(providers.into_iter().map(|p| p.domain().to_string()).collect())
    }

    /// Next front domain in round-robin order. Panics if the domain list is
    /// empty; callers gate on `enable_domain_fronting` plus a non-empty list.
    pub fn next_domain(&self) -> String {
        let current = self.index.fetch_add(1, Ordering::SeqCst);
        self.domains[current % self.domains.len()].clone()
    }

    pub fn random_domain(&self) -> String {
        use rand::seq::SliceRandom;
        let mut rng = rand::thread_rng();
        self.domains.choose(&mut rng).cloned().unwrap_or_else(|| self.domains[0].clone())
    }

    pub fn set_domains(&mut self, domains: Vec<String>) {
        self.domains = domains;
        self.index.store(0, Ordering::SeqCst);
    }
}

/// Returns the (SNI, `:authority`) pair for a connection. When fronting is
/// enabled the SNI carries the front domain while `:authority` carries the
/// real destination, per the masquerading pipeline's header synthesis.
pub fn connection_identity(fronter: Option<&DomainFronter>, real_host: &str) -> (String, String) {
    match fronter {
        Some(f) => (f.next_domain(), real_host.to_string()),
        None => (real_host.to_string(), real_host.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robins_through_domains() {
        let fronter = DomainFronter::new(vec!["a.example".into(), "b.example".into()]);
        assert_eq!(fronter.next_domain(), "a.example");
        assert_eq!(fronter.next_domain(), "b.example");
        assert_eq!(fronter.next_domain(), "a.example");
    }

    #[test]
    fn no_fronter_uses_real_host_for_both() {
        let (sni, authority) = connection_identity(None, "real.example");
        assert_eq!(sni, "real.example");
        assert_eq!(authority, "real.example");
    }

    #[test]
    fn fronter_splits_sni_from_authority() {
        let fronter = DomainFronter::from_providers(vec![CdnProvider::Cloudflare]);
        let (sni, authority) = connection_identity(Some(&fronter), "real.example");
        assert_eq!(sni, "www.cloudflare.com");
        assert_eq!(authority, "real.example");
    }
}
