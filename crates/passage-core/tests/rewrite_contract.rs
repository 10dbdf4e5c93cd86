//! Cross-module contract: every rewritten reference must decode back to a
//! valid absolute target, and rewriting must be stable under repetition.

use passage_core::{absolutize, fingerprint};
use url::Url;

const PUBLIC: &str = "http://127.0.0.1:3003";

#[test]
fn codec_round_trips_a_url_corpus() {
    let corpus = [
        "https://www.example.com/",
        "https://www.example.com/watch?v=abc&t=10",
        "http://user.example.org:8080/a/b/c",
        "https://xn--bcher-kva.example/path",
        "https://example.com/percent%20encoded?q=a%2Fb",
    ];
    for target in corpus {
        let decoded = fingerprint::decode(&fingerprint::encode(target)).unwrap();
        assert_eq!(decoded.as_str(), Url::parse(target).unwrap().as_str());
    }
}

#[test]
fn rewritten_references_always_point_at_the_public_origin() {
    let base = Url::parse("https://www.example.com/app/index.html").unwrap();
    let references = [
        "/api/feed",
        "//cdn.example.com/lib.js",
        "assets/logo.png",
        "../shared/style.css",
        "https://other.example.net/embed",
    ];
    for reference in references {
        let rewritten = absolutize::rewrite_reference(reference, &base, PUBLIC)
            .unwrap_or_else(|| panic!("{reference} should be rewritable"));
        assert!(rewritten.starts_with(PUBLIC), "{rewritten}");

        let fp = rewritten.split("__cpo=").nth(1).unwrap();
        let decoded = fingerprint::decode(fp).unwrap();
        assert!(matches!(decoded.scheme(), "http" | "https"));
    }
}

#[test]
fn inert_references_are_never_rewritten() {
    let base = Url::parse("https://www.example.com/").unwrap();
    for reference in [
        "#anchor",
        "data:text/plain,hi",
        "blob:https://x",
        "javascript:void(0)",
        "mailto:a@example.com",
    ] {
        assert!(
            absolutize::rewrite_reference(reference, &base, PUBLIC).is_none(),
            "{reference} must be left alone"
        );
    }
}

#[test]
fn rewriting_an_already_proxied_reference_is_refused() {
    let base = Url::parse("https://www.example.com/").unwrap();
    let once = absolutize::rewrite_reference("/page", &base, PUBLIC).unwrap();
    assert!(absolutize::rewrite_reference(&once, &base, PUBLIC).is_none());
}
