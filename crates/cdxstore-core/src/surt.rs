//! SURT canonicalization.
//!
//! `http://www.example.org/Some/Path` becomes `org,example)/some/path`: the
//! scheme is dropped, the host is lowercased and its labels reversed with
//! comma separators, leading `www` labels are stripped, and `)` closes the
//! authority. Same-site URLs therefore cluster under a common byte prefix,
//! which is what the index and the access-control prefix matching key on.

const DEFAULT_PORTS: [(u16, &str); 2] = [(80, "http"), (443, "https")];

/// Canonicalize a URL into its SURT key form.
///
/// Deterministic and idempotent: output never contains `://`, and any input
/// without `://` is treated as already canonical and only case-folded.
pub fn surt_canonicalize(url: &str) -> String {
    let trimmed = url.trim();
    let Some((scheme, rest)) = trimmed.split_once("://") else {
        return trimmed.to_ascii_lowercase();
    };
    let scheme = scheme.to_ascii_lowercase();

    // Drop any fragment, then split authority from path+query.
    let rest = rest.split('#').next().unwrap_or("");
    let (authority, path_and_query) = match rest.find(['/', '?']) {
        Some(i) if rest.as_bytes()[i] == b'/' => (&rest[..i], rest[i..].to_string()),
        Some(i) => (&rest[..i], format!("/{}", &rest[i..])),
        None => (rest, "/".to_string()),
    };

    // Userinfo is never part of the key.
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) if p.bytes().all(|b| b.is_ascii_digit()) && !p.is_empty() => {
            (h, p.parse::<u16>().ok())
        }
        _ => (authority, None),
    };

    let host = host.to_ascii_lowercase();
    let mut labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() > 2 {
        if let Some(first) = labels.first() {
            if is_www_label(first) {
                labels.remove(0);
            }
        }
    }
    labels.reverse();

    let mut out = labels.join(",");
    if let Some(p) = port {
        if !DEFAULT_PORTS.iter().any(|(dp, ds)| *dp == p && *ds == scheme) {
            out.push(':');
            out.push_str(&p.to_string());
        }
    }
    out.push(')');
    out.push_str(&canonicalize_path(&path_and_query));
    out
}

fn is_www_label(label: &str) -> bool {
    let Some(rest) = label.strip_prefix("www") else {
        return false;
    };
    rest.bytes().all(|b| b.is_ascii_digit())
}

fn canonicalize_path(path_and_query: &str) -> String {
    let lowered = path_and_query.to_ascii_lowercase();
    match lowered.split_once('?') {
        Some((path, "")) => path.to_string(),
        Some((path, query)) => {
            // Sorting the parameters makes logically equal URLs key-equal.
            let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
            params.sort_unstable();
            if params.is_empty() {
                path.to_string()
            } else {
                format!("{path}?{}", params.join("&"))
            }
        }
        None => lowered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverses_host_and_drops_scheme() {
        assert_eq!(surt_canonicalize("http://example.org/"), "org,example)/");
        assert_eq!(
            surt_canonicalize("https://archive.example.org/a/b"),
            "org,example,archive)/a/b"
        );
    }

    #[test]
    fn strips_leading_www_labels() {
        assert_eq!(surt_canonicalize("http://www.example.org/"), "org,example)/");
        assert_eq!(surt_canonicalize("http://www2.example.org/"), "org,example)/");
        // A bare two-label host named www is kept: it is the site itself.
        assert_eq!(surt_canonicalize("http://www.org/"), "org,www)/");
    }

    #[test]
    fn lowercases_host_and_path() {
        assert_eq!(
            surt_canonicalize("HTTP://Example.ORG/Index.HTML"),
            "org,example)/index.html"
        );
    }

    #[test]
    fn keeps_non_default_ports_only() {
        assert_eq!(surt_canonicalize("http://example.org:80/"), "org,example)/");
        assert_eq!(surt_canonicalize("https://example.org:443/"), "org,example)/");
        assert_eq!(
            surt_canonicalize("http://example.org:8080/x"),
            "org,example:8080)/x"
        );
    }

    #[test]
    fn sorts_query_parameters() {
        assert_eq!(
            surt_canonicalize("http://example.org/p?b=2&a=1"),
            "org,example)/p?a=1&b=2"
        );
        assert_eq!(surt_canonicalize("http://example.org/p?"), "org,example)/p");
    }

    #[test]
    fn drops_fragment_and_userinfo() {
        assert_eq!(
            surt_canonicalize("http://user:pw@example.org/a#frag"),
            "org,example)/a"
        );
    }

    #[test]
    fn missing_path_becomes_root() {
        assert_eq!(surt_canonicalize("http://example.org"), "org,example)/");
        assert_eq!(
            surt_canonicalize("http://example.org?a=1"),
            "org,example)/?a=1"
        );
    }

    #[test]
    fn idempotent_over_its_own_output() {
        for url in [
            "http://www.example.org/Some/Path?b=2&a=1",
            "https://example.org:8080/",
            "http://example.org",
            "org,example)/already/canonical",
        ] {
            let once = surt_canonicalize(url);
            assert_eq!(surt_canonicalize(&once), once, "not idempotent for {url}");
        }
    }
}
