//! Markup matchers
//!
//! Every shape-dependent assumption about the remote markup lives here: the
//! selectors, text patterns and probe scripts the orchestrator uses to find
//! its way around the login flow. The remote markup is not contractually
//! stable, so adapting to upstream drift should touch this module and
//! nothing else.
//!
//! Each probe script carries a stable inner function name (`findChallengeStart`,
//! `findPuzzleTiles`, ...) so scripted test doubles can recognize it.

use crate::browser::page::{FrameId, PageHandle};
use crate::error::Result;
use crate::flow::frames::FrameProbe;
use async_trait::async_trait;

/// Identity string presented to the remote site. Static on purpose; this
/// system does not attempt to defeat fingerprinting beyond supplying it.
pub const IDENTITY_STRING: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/120.0.0.0 Safari/537.36";

/// All markup-shape knowledge for one version of the remote flow.
#[derive(Debug, Clone)]
pub struct MarkupProfile {
    // Login form.
    pub identity_field: String,
    pub secret_field: String,
    pub login_submit: String,
    /// Visible after a rejected secret.
    pub credential_error: String,

    // Puzzle challenge. The start control is matched by an ordered list of
    // strategies because any single one may stop matching after a cosmetic
    // upstream change.
    pub start_attribute: String,
    pub start_class: String,
    pub start_text_pattern: String,
    pub tile_selector: String,
    pub tile_count: usize,
    pub error_indicator: String,
    pub retry_text_pattern: String,

    // One-time code and phone registration.
    pub code_input: String,
    pub code_submit: String,
    pub phone_input: String,
    pub country_input: String,
    pub phone_submit: String,
    pub sms_heading_pattern: String,
    pub phone_heading_pattern: String,

    // Address patterns.
    pub dead_end_segment: String,
    pub authenticated_segment: String,

    /// Phone numbers shorter than this are rejected locally.
    pub phone_min_digits: usize,
}

impl Default for MarkupProfile {
    fn default() -> Self {
        Self {
            identity_field: "input[name='email'], input[name='username'], input[type='email']"
                .into(),
            secret_field: "input[name='password'], input[type='password']".into(),
            login_submit: "button[type='submit'], input[type='submit']".into(),
            credential_error: ".password-error, .login-error, [data-testid='signin-error']".into(),
            start_attribute: "[data-testid='challenge-start'], [data-action='start-captcha']"
                .into(),
            start_class: "button.challenge-start, .captcha-begin, .px-captcha-button".into(),
            start_text_pattern: "press|hold|start|begin|verify".into(),
            tile_selector: ".challenge-tile, [class*='captcha-tile'], [id^='tile-']".into(),
            tile_count: 6,
            error_indicator: "[role='alert'], .challenge-error, .error-message".into(),
            retry_text_pattern: "try again|retry".into(),
            code_input: "input[autocomplete='one-time-code'], input[name*='code'], #otp".into(),
            code_submit: "button[type='submit'], [data-testid='code-submit']".into(),
            phone_input: "input[type='tel'], input[name*='phone']".into(),
            country_input: "select[name*='country'], input[name*='country']".into(),
            phone_submit: "button[type='submit'], [data-testid='phone-submit']".into(),
            sms_heading_pattern: "enter the code|sent you a code|verification code".into(),
            phone_heading_pattern: "add a phone|phone number|verify your phone".into(),
            dead_end_segment: "/login/challenge".into(),
            authenticated_segment: "/account".into(),
            phone_min_digits: 8,
        }
    }
}

impl MarkupProfile {
    /// Ordered-fallback search for the puzzle start control: attribute match,
    /// then class match, then a free-text scan over interactive controls.
    /// Resolves to `{strategy, selector}` or `null`.
    pub fn probe_start_control(&self) -> String {
        format!(
            r#"
            (() => {{
                function findChallengeStart() {{
                    let el = document.querySelector("{attr}");
                    if (el) return {{ strategy: "attribute", selector: "{attr}" }};
                    el = document.querySelector("{class}");
                    if (el) return {{ strategy: "class", selector: "{class}" }};
                    const pattern = new RegExp("{text}", "i");
                    const controls = document.querySelectorAll("button, a, [role='button']");
                    for (const c of controls) {{
                        if (pattern.test(c.textContent || "")) {{
                            c.setAttribute("data-authrelay-start", "1");
                            return {{ strategy: "text", selector: "[data-authrelay-start]" }};
                        }}
                    }}
                    return null;
                }}
                return findChallengeStart();
            }})()
            "#,
            attr = self.start_attribute,
            class = self.start_class,
            text = self.start_text_pattern,
        )
    }

    /// Resolves to `{count}` when the document holds the full tile set,
    /// `null` otherwise. Anything but exactly `tile_count` tiles is treated
    /// as "not the tile document".
    pub fn probe_tiles(&self) -> String {
        format!(
            r#"
            (() => {{
                function findPuzzleTiles() {{
                    const tiles = document.querySelectorAll("{sel}");
                    if (tiles.length === {count}) return {{ count: tiles.length }};
                    return null;
                }}
                return findPuzzleTiles();
            }})()
            "#,
            sel = self.tile_selector,
            count = self.tile_count,
        )
    }

    /// Renders the first tile's background image onto a canvas and resolves
    /// to a `data:` URL string, or `null` when there is nothing to capture.
    /// The image is a transient in-memory blob on the remote page, so this
    /// is the only way to get the bytes out.
    pub fn capture_tile_image(&self) -> String {
        format!(
            r#"
            (async () => {{
                async function captureTileImage() {{
                    const tile = document.querySelector("{sel}");
                    if (!tile) return null;
                    let src = null;
                    const img = tile.querySelector("img") || (tile.tagName === "IMG" ? tile : null);
                    if (img) {{
                        src = img.currentSrc || img.src;
                    }} else {{
                        const bg = getComputedStyle(tile).backgroundImage;
                        const m = bg && bg.match(/url\(["']?(.+?)["']?\)/);
                        if (m) src = m[1];
                    }}
                    if (!src) return null;
                    if (src.startsWith("data:")) return src;
                    return await new Promise((resolve) => {{
                        const image = new Image();
                        image.onload = () => {{
                            try {{
                                const canvas = document.createElement("canvas");
                                canvas.width = image.naturalWidth || image.width;
                                canvas.height = image.naturalHeight || image.height;
                                canvas.getContext("2d").drawImage(image, 0, 0);
                                resolve(canvas.toDataURL("image/png"));
                            }} catch (e) {{
                                resolve(null);
                            }}
                        }};
                        image.onerror = () => resolve(null);
                        image.src = src;
                    }});
                }}
                return await captureTileImage();
            }})()
            "#,
            sel = self.tile_selector,
        )
    }

    /// Clicks the `index`-th tile (1-based). Resolves to `true` on a click.
    pub fn click_tile(&self, index: usize) -> String {
        format!(
            r#"
            (() => {{
                function clickPuzzleTile() {{
                    const tiles = document.querySelectorAll("{sel}");
                    if (tiles.length < {index}) return false;
                    tiles[{index} - 1].click();
                    return true;
                }}
                return clickPuzzleTile();
            }})()
            "#,
            sel = self.tile_selector,
            index = index,
        )
    }

    /// Resolves to the visible error text, or `null`.
    pub fn probe_error_indicator(&self) -> String {
        format!(
            r#"
            (() => {{
                function findErrorIndicator() {{
                    for (const el of document.querySelectorAll("{sel}")) {{
                        const text = (el.textContent || "").trim();
                        if (text && el.offsetParent !== null) return text;
                    }}
                    return null;
                }}
                return findErrorIndicator();
            }})()
            "#,
            sel = self.error_indicator,
        )
    }

    /// Clicks the try-again control when present. Resolves to `true` if
    /// something was clicked.
    pub fn click_retry_control(&self) -> String {
        format!(
            r#"
            (() => {{
                function clickRetryControl() {{
                    const pattern = new RegExp("{text}", "i");
                    const controls = document.querySelectorAll("button, a, [role='button']");
                    for (const c of controls) {{
                        if (pattern.test(c.textContent || "")) {{
                            c.click();
                            return true;
                        }}
                    }}
                    return false;
                }}
                return clickRetryControl();
            }})()
            "#,
            text = self.retry_text_pattern,
        )
    }

    /// Resolves to the rejection text when the secret was refused, `null`
    /// otherwise.
    pub fn probe_credential_error(&self) -> String {
        format!(
            r#"
            (() => {{
                function findCredentialError() {{
                    for (const el of document.querySelectorAll("{sel}")) {{
                        const text = (el.textContent || "").trim();
                        if (text) return text;
                    }}
                    return null;
                }}
                return findCredentialError();
            }})()
            "#,
            sel = self.credential_error,
        )
    }

    /// Resolves to `true` when the document contains the one-time-code form.
    pub fn probe_code_form(&self) -> String {
        format!(
            r#"
            (() => {{
                function findCodeForm() {{
                    return document.querySelector("{input}") !== null ? true : null;
                }}
                return findCodeForm();
            }})()
            "#,
            input = self.code_input,
        )
    }

    /// Resolves to `true` when the document contains the phone form.
    pub fn probe_phone_form(&self) -> String {
        format!(
            r#"
            (() => {{
                function findPhoneForm() {{
                    return document.querySelector("{input}") !== null ? true : null;
                }}
                return findPhoneForm();
            }})()
            "#,
            input = self.phone_input,
        )
    }

    /// Resolves to the page's leading heading text, or `null`.
    pub fn read_heading(&self) -> String {
        r#"
        (() => {
            function readHeading() {
                const h = document.querySelector("h1, h2, [role='heading']");
                const text = h && (h.textContent || "").trim();
                return text || null;
            }
            return readHeading();
        })()
        "#
        .to_string()
    }

    /// Serialized descriptors for every interactive control in the document,
    /// capped per tag so a pathological page cannot flood the caller.
    pub fn list_controls(&self) -> String {
        r#"
        (() => {
            function listInteractiveControls() {
                const tags = ["button", "a", "input", "select", "textarea"];
                const out = [];
                tags.forEach((tag) => {
                    document.querySelectorAll(tag).forEach((el, idx) => {
                        if (idx >= 50) return;
                        const rect = el.getBoundingClientRect();
                        out.push({
                            selector: `${tag}:nth-of-type(${idx + 1})`,
                            tag,
                            text: el.textContent ? el.textContent.trim().substring(0, 100) : "",
                            is_visible: rect.width > 0 && rect.height > 0,
                            is_enabled: !el.disabled,
                        });
                    });
                });
                return out.length > 0 ? out : null;
            }
            return listInteractiveControls();
        })()
        "#
        .to_string()
    }

    /// Whether an address points at the known dead-end challenge page.
    pub fn is_dead_end(&self, url: &str) -> bool {
        url.contains(&self.dead_end_segment)
    }

    /// Whether an address is inside the authenticated area.
    pub fn is_authenticated(&self, url: &str) -> bool {
        url.contains(&self.authenticated_segment)
    }
}

/// Runs a probe script inside each candidate frame; a non-null, non-false
/// result is a hit, paired with the frame that produced it.
pub struct JsProbe<'a> {
    pub page: &'a dyn PageHandle,
    pub expression: String,
}

impl<'a> JsProbe<'a> {
    pub fn new(page: &'a dyn PageHandle, expression: String) -> Self {
        Self { page, expression }
    }
}

#[async_trait]
impl FrameProbe for JsProbe<'_> {
    type Hit = (FrameId, serde_json::Value);

    async fn probe(&self, frame: &FrameId) -> Result<Option<Self::Hit>> {
        let value = self.page.eval(frame, &self.expression).await?;
        match value {
            serde_json::Value::Null | serde_json::Value::Bool(false) => Ok(None),
            other => Ok(Some((frame.clone(), other))),
        }
    }
}
