// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Hawk request authentication.

Hawk is a MAC based HTTP authentication scheme. A request carries a
timestamp, a nonce, a hash of its payload and an HMAC-SHA256 over those
plus the request target, keyed by a secret shared with the server.
*/

use {
    rand::{distributions::Alphanumeric, Rng},
    ring::{digest, hmac},
    std::{
        io::Read,
        time::{SystemTime, UNIX_EPOCH},
    },
    url::Url,
};

/// Hash a request payload for inclusion in the MAC.
///
/// `content_type` is normalized by dropping parameters and lower casing.
pub fn payload_hash(content_type: &str, mut body: impl Read) -> std::io::Result<String> {
    let content_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let mut context = digest::Context::new(&digest::SHA256);
    context.update(b"hawk.1.payload\n");
    context.update(content_type.as_bytes());
    context.update(b"\n");

    let mut buffer = [0u8; 32768];
    loop {
        let count = body.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        context.update(&buffer[0..count]);
    }

    context.update(b"\n");

    Ok(base64::encode(context.finish().as_ref()))
}

/// Hawk credentials and per-request values.
#[derive(Clone, Debug)]
pub struct HawkRequest<'a> {
    pub id: &'a str,
    pub key: &'a str,
    pub ts: u64,
    pub nonce: String,
    pub hash: Option<&'a str>,
    pub ext: Option<&'a str>,
}

impl<'a> HawkRequest<'a> {
    /// Credentials with a fresh timestamp and nonce.
    pub fn new(id: &'a str, key: &'a str, hash: Option<&'a str>) -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let nonce = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();

        Self {
            id,
            key,
            ts,
            nonce,
            hash,
            ext: None,
        }
    }

    fn normalized_string(&self, method: &str, url: &Url) -> String {
        let mut resource = url.path().to_string();
        if let Some(query) = url.query() {
            resource.push('?');
            resource.push_str(query);
        }

        format!(
            "hawk.1.header\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
            self.ts,
            self.nonce,
            method.to_ascii_uppercase(),
            resource,
            url.host_str().unwrap_or_default().to_ascii_lowercase(),
            url.port_or_known_default().unwrap_or_default(),
            self.hash.unwrap_or_default(),
            self.ext.unwrap_or_default(),
        )
    }

    /// Compute the request MAC.
    pub fn mac(&self, method: &str, url: &Url) -> String {
        let key = hmac::Key::new(hmac::HMAC_SHA256, self.key.as_bytes());
        let tag = hmac::sign(&key, self.normalized_string(method, url).as_bytes());

        base64::encode(tag.as_ref())
    }

    /// Render the `Authorization` header value.
    pub fn authorization(&self, method: &str, url: &Url) -> String {
        let mut header = format!(
            "Hawk id=\"{}\", ts=\"{}\", nonce=\"{}\"",
            self.id, self.ts, self.nonce
        );
        if let Some(hash) = self.hash {
            header.push_str(&format!(", hash=\"{}\"", hash));
        }
        if let Some(ext) = self.ext.filter(|e| !e.is_empty()) {
            header.push_str(&format!(", ext=\"{}\"", ext));
        }
        header.push_str(&format!(", mac=\"{}\"", self.mac(method, url)));

        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "dh37fgj492je";
    const KEY: &str = "werxhqb98rpaxn39848xrunpaw3489ruxnpa98w4rxn";

    fn request(hash: Option<&'static str>) -> HawkRequest<'static> {
        HawkRequest {
            id: ID,
            key: KEY,
            ts: 1353832234,
            nonce: "j4h3g2".to_string(),
            hash,
            ext: Some("some-app-ext-data"),
        }
    }

    #[test]
    fn payload_hash_reference() -> std::io::Result<()> {
        assert_eq!(
            payload_hash("text/plain", "Thank you for flying Hawk".as_bytes())?,
            "Yi9LfIIFRtBEPt74PVmbTF/xVAwPn7ub15ePICfgnuY="
        );
        assert_eq!(
            payload_hash("Text/Plain; charset=utf-8", "Thank you for flying Hawk".as_bytes())?,
            "Yi9LfIIFRtBEPt74PVmbTF/xVAwPn7ub15ePICfgnuY="
        );

        Ok(())
    }

    #[test]
    fn mac_reference() -> Result<(), url::ParseError> {
        let url = Url::parse("http://example.com:8000/resource/1?b=1&a=2")?;

        assert_eq!(
            request(None).mac("GET", &url),
            "6R4rV5iE+NPoym+WwjeHzjAGXUtLNIxmo1vpMofpLAE="
        );
        assert_eq!(
            request(Some("Yi9LfIIFRtBEPt74PVmbTF/xVAwPn7ub15ePICfgnuY=")).mac("POST", &url),
            "aSe1DERmZuRl3pI36/9BdZmnErTw3sNzOOAUlfeKjVw="
        );

        Ok(())
    }

    #[test]
    fn header_layout() -> Result<(), url::ParseError> {
        let url = Url::parse("https://autograph.example.com/sign/hash")?;
        let mut req = HawkRequest::new("user", "secret", Some("abc="));
        assert_eq!(req.nonce.len(), 6);

        req.ts = 1;
        req.nonce = "nonce1".to_string();
        let header = req.authorization("POST", &url);

        assert!(header.starts_with("Hawk id=\"user\", ts=\"1\", nonce=\"nonce1\", hash=\"abc=\", mac=\""));
        assert!(req
            .normalized_string("post", &url)
            .contains("\nPOST\n/sign/hash\nautograph.example.com\n443\nabc=\n\n"));

        Ok(())
    }
}
