//! Self-contained HTML blobs: the landing page and the upstream-failure
//! retry page. Both carry inline scripts only, so they keep working with
//! every security policy stripped.

pub const LANDING_PAGE: &str = r##"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>passage</title>
<style>
  body { font-family: system-ui, sans-serif; background: #101418; color: #e8e8e8;
         display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; }
  .card { background: #1a2026; border-radius: 12px; padding: 2.5rem; width: min(520px, 90vw); }
  h1 { margin: 0 0 1rem; font-size: 1.4rem; }
  form { display: flex; gap: .5rem; }
  input { flex: 1; padding: .7rem .9rem; border-radius: 8px; border: 1px solid #2e3a44;
          background: #10161b; color: inherit; font-size: 1rem; }
  button { padding: .7rem 1.2rem; border-radius: 8px; border: 0; background: #2f81f7;
           color: white; font-size: 1rem; cursor: pointer; }
  p { color: #9aa7b0; font-size: .85rem; }
</style>
</head>
<body>
<div class="card">
  <h1>passage</h1>
  <form id="go">
    <input id="u" type="text" placeholder="https://example.com" autofocus>
    <button type="submit">Open</button>
  </form>
  <p>Pages are fetched server-side and rewritten to flow back through this host.</p>
</div>
<script>
document.getElementById('go').addEventListener('submit', function (ev) {
  ev.preventDefault();
  var raw = document.getElementById('u').value.trim();
  if (!raw) return;
  if (!/^https?:\/\//i.test(raw)) raw = 'https://' + raw;
  var m = raw.match(/^([a-z]+:\/\/[^\/]+)([^?#]*)(\?[^#]*)?/i);
  if (!m) return;
  var origin = m[1];
  var path = m[2] || '/';
  var query = m[3] || '';
  var fp = btoa(origin).replace(/\+/g, '-').replace(/\//g, '_').replace(/=+$/, '');
  window.location.href = path + query + (query ? '&' : '?') + '__cpo=' + fp;
});
</script>
</body>
</html>
"##;

const RETRY_PAGE: &str = r##"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>Upstream unavailable</title>
<style>
  body { font-family: system-ui, sans-serif; background: #101418; color: #e8e8e8;
         display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; }
  .card { background: #1a2026; border-radius: 12px; padding: 2.5rem; text-align: center; }
  button { margin-top: 1rem; padding: .6rem 1.4rem; border-radius: 8px; border: 0;
           background: #2f81f7; color: white; cursor: pointer; }
</style>
</head>
<body>
<div class="card">
  <h1>Upstream unavailable</h1>
  <p>{{reason}}</p>
  <p>Retrying in <span id="n">5</span>s&hellip;</p>
  <button onclick="window.location.reload()">Retry now</button>
</div>
<script>
var n = 5;
setInterval(function () {
  n -= 1;
  if (n <= 0) { window.location.reload(); }
  document.getElementById('n').textContent = n;
}, 1000);
</script>
</body>
</html>
"##;

pub fn retry_page(reason: &str) -> String {
    RETRY_PAGE.replace("{{reason}}", &escape_html(reason))
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_page_embeds_the_reason_escaped() {
        let page = retry_page("<script>bad</script> timed out");
        assert!(page.contains("&lt;script&gt;bad&lt;/script&gt; timed out"));
        assert!(!page.contains("<script>bad"));
    }
}
