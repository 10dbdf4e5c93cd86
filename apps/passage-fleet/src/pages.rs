//! Static HTML blobs served by the broker, plus the enhancement script
//! injected into the containers' root page. All self-contained inline
//! HTML/JS so they survive with security policies stripped.

pub const LANDING_PAGE: &str = r##"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>passage fleet</title>
<style>
  body { font-family: system-ui, sans-serif; background: #101418; color: #e8e8e8;
         display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; }
  .card { background: #1a2026; border-radius: 12px; padding: 2.5rem; width: min(480px, 90vw); text-align: center; }
  button { padding: .8rem 1.6rem; border-radius: 8px; border: 0; background: #2f81f7;
           color: white; font-size: 1.05rem; cursor: pointer; }
  #msg { color: #9aa7b0; min-height: 1.4rem; margin-top: 1rem; }
</style>
</head>
<body>
<div class="card">
  <h1>passage fleet</h1>
  <button id="go">Open a browser</button>
  <p id="msg"></p>
</div>
<script>
var msg = document.getElementById('msg');
document.getElementById('go').addEventListener('click', function () {
  msg.textContent = 'Requesting a browser…';
  fetch('/api/request-browser', {
    method: 'POST',
    headers: { 'Content-Type': 'application/json' },
    body: JSON.stringify({})
  }).then(function (r) { return r.json(); }).then(function (data) {
    if (data.success) {
      window.location.href = data.browserUrl;
    } else if (data.error === 'all_browsers_in_use') {
      msg.textContent = 'All browsers are busy, retry in ' + data.retryAfterSeconds + 's.';
    } else {
      msg.textContent = 'Request failed.';
    }
  }).catch(function () { msg.textContent = 'Request failed.'; });
});
</script>
</body>
</html>
"##;

pub const ACCESS_DENIED_PAGE: &str = r##"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>Access denied</title>
<style>
  body { font-family: system-ui, sans-serif; background: #101418; color: #e8e8e8;
         display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; }
  .card { background: #1a2026; border-radius: 12px; padding: 2.5rem; text-align: center; }
  a { color: #2f81f7; }
</style>
</head>
<body>
<div class="card">
  <h1>Access denied</h1>
  <p>This browser session is not yours, or its link has already been used.</p>
  <p><a href="/">Request a browser</a></p>
</div>
</body>
</html>
"##;

pub const STARTING_UP_PAGE: &str = r##"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>Browser starting</title>
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
  <h1>Your browser is starting</h1>
  <p>Reconnecting in <span id="n">5</span>s&hellip;</p>
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

/// In-page enhancements injected into the container's root HTML: heartbeat
/// loop, touch scrolling, audio side-channel player, and quality hints.
pub const ENHANCEMENT_SCRIPT: &str = r##"<script>
(function () {
  'use strict';
  if (window.__passage_fleet_enhanced) { return; }
  window.__passage_fleet_enhanced = true;

  var m = window.location.pathname.match(/^\/browser\/(\d+)\//);
  var browserId = m ? parseInt(m[1], 10) : null;

  // Session heartbeat keeps the slot alive while this tab is open.
  if (browserId !== null) {
    setInterval(function () {
      fetch('/api/heartbeat', {
        method: 'POST',
        headers: { 'Content-Type': 'application/json' },
        body: JSON.stringify({ browserId: browserId })
      }).catch(function () {});
    }, 30000);
  }

  // Two-finger touch scrolling forwarded as wheel events.
  var lastTouchY = null;
  document.addEventListener('touchstart', function (ev) {
    if (ev.touches.length === 2) { lastTouchY = ev.touches[0].clientY; }
  }, { passive: true });
  document.addEventListener('touchmove', function (ev) {
    if (ev.touches.length === 2 && lastTouchY !== null) {
      var dy = lastTouchY - ev.touches[0].clientY;
      lastTouchY = ev.touches[0].clientY;
      var canvas = document.querySelector('canvas');
      if (canvas) {
        canvas.dispatchEvent(new WheelEvent('wheel', { deltaY: dy * 3, bubbles: true }));
      }
    }
  }, { passive: true });
  document.addEventListener('touchend', function () { lastTouchY = null; });

  // Audio side-channel: MPEG-TS over a binary WebSocket, played via MSE.
  function startAudio() {
    if (browserId === null || window.__passage_audio) { return; }
    var proto = window.location.protocol === 'https:' ? 'wss://' : 'ws://';
    var ws = new WebSocket(proto + window.location.host + '/browser/' + browserId + '/audio');
    ws.binaryType = 'arraybuffer';
    var audio = document.createElement('audio');
    audio.autoplay = true;
    var source = new MediaSource();
    audio.src = URL.createObjectURL(source);
    var queue = [];
    var buffer = null;
    source.addEventListener('sourceopen', function () {
      buffer = source.addSourceBuffer('audio/mp2t; codecs="mp4a.40.2"');
      buffer.addEventListener('updateend', function () {
        if (queue.length && !buffer.updating) { buffer.appendBuffer(queue.shift()); }
      });
    });
    ws.onmessage = function (ev) {
      if (!buffer || buffer.updating || queue.length) { queue.push(ev.data); return; }
      try { buffer.appendBuffer(ev.data); } catch (e) { queue.length = 0; }
    };
    ws.onclose = function () { window.__passage_audio = null; };
    window.__passage_audio = ws;
    document.body.appendChild(audio);
  }
  document.addEventListener('click', startAudio, { once: true });

  // Quality hint: prefer lossless rendering on fast connections.
  try {
    var conn = navigator.connection;
    if (conn && conn.downlink && conn.downlink < 2 && window.localStorage) {
      window.localStorage.setItem('passage_quality', 'low');
    }
  } catch (e) {}

  // Minimal tooltips for the toolbar, when one exists.
  var bar = document.querySelector('[role="toolbar"]');
  if (bar) {
    bar.querySelectorAll('button').forEach(function (b) {
      if (!b.title && b.getAttribute('aria-label')) { b.title = b.getAttribute('aria-label'); }
    });
  }
})();
</script>"##;

/// Inject the enhancement script just before `</body>`, else before
/// `</html>`, else after the last `</script>`, else append.
pub fn inject_enhancement(html: &str) -> String {
    if html.contains("__passage_fleet_enhanced") {
        return html.to_string();
    }
    let lower = html.to_ascii_lowercase();
    let insert_at = lower
        .rfind("</body>")
        .or_else(|| lower.rfind("</html>"))
        .or_else(|| lower.rfind("</script>").map(|at| at + "</script>".len()));
    match insert_at {
        Some(at) => {
            let mut out = String::with_capacity(html.len() + ENHANCEMENT_SCRIPT.len());
            out.push_str(&html[..at]);
            out.push_str(ENHANCEMENT_SCRIPT);
            out.push_str(&html[at..]);
            out
        }
        None => {
            let mut out = html.to_string();
            out.push_str(ENHANCEMENT_SCRIPT);
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enhancement_lands_before_body_close() {
        let html = "<html><body><p>x</p></body></html>";
        let out = inject_enhancement(html);
        let script_at = out.find("__passage_fleet_enhanced").unwrap();
        let body_close = out.find("</body>").unwrap();
        assert!(script_at < body_close);
    }

    #[test]
    fn enhancement_falls_back_to_last_script() {
        let html = "<script>a()</script><script>b()</script><p>tail</p>";
        let out = inject_enhancement(html);
        let b_at = out.find("b()").unwrap();
        let script_at = out.find("__passage_fleet_enhanced").unwrap();
        assert!(script_at > b_at);
    }

    #[test]
    fn injection_is_idempotent() {
        let once = inject_enhancement("<html><body></body></html>");
        let twice = inject_enhancement(&once);
        assert_eq!(once, twice);
    }
}
