use once_cell::sync::Lazy;
use regex::Regex;

/// Application names that identify a browser.
const BROWSER_APPLICATIONS: &[&str] = &[
    "google chrome",
    "chromium",
    "chrome",
    "mozilla firefox",
    "firefox",
    "microsoft edge",
    "edge",
    "safari",
    "opera",
    "brave",
    "vivaldi",
    "tor browser",
];

/// Browser names and search markers that must never be mistaken for a site
/// name. Multi-word entries come first so scrubbing removes them whole.
const BROWSER_AND_SEARCH_TERMS: &[&str] = &[
    "google chrome",
    "chrome",
    "chromium",
    "mozilla firefox",
    "firefox",
    "microsoft edge",
    "edge",
    "safari",
    "opera",
    "brave",
    "vivaldi",
    "tor browser",
    "google search",
    "search",
];

/// Known-site dictionary, matched by substring on a title part. Multi-word
/// keys first; "dev" last because it is the loosest substring.
const SITE_DOMAINS: &[(&str, &str)] = &[
    ("stack overflow", "stackoverflow.com"),
    ("stack exchange", "stackexchange.com"),
    ("microsoft teams", "teams.microsoft.com"),
    ("google meet", "meet.google.com"),
    ("youtube", "youtube.com"),
    ("github", "github.com"),
    ("facebook", "facebook.com"),
    ("twitter", "twitter.com"),
    ("x.com", "x.com"),
    ("linkedin", "linkedin.com"),
    ("reddit", "reddit.com"),
    ("instagram", "instagram.com"),
    ("discord", "discord.com"),
    ("slack", "slack.com"),
    ("gmail", "gmail.com"),
    ("outlook", "outlook.com"),
    ("notion", "notion.so"),
    ("figma", "figma.com"),
    ("trello", "trello.com"),
    ("asana", "asana.com"),
    ("jira", "jira.com"),
    ("confluence", "confluence.com"),
    ("medium", "medium.com"),
    ("wikipedia", "wikipedia.org"),
    ("amazon", "amazon.com"),
    ("netflix", "netflix.com"),
    ("spotify", "spotify.com"),
    ("zoom", "zoom.us"),
    ("dev", "dev.to"),
];

/// Closed allow-list of TLD tokens accepted when scanning a bare
/// `word.tld` in a title.
const TLD_TOKENS: &str = "com|org|net|io|co|edu|gov|uk|de|fr|jp|au|ca|in|br|ru|cn|es|it|nl|se|\
no|dk|fi|pl|cz|at|ch|be|ie|pt|gr|tr|za|mx|ar|cl|pe|ve|ec|uy|py|bo|cr|pa|do|gt|hn|ni|sv|bz|\
jm|tt|bb|gd|lc|vc|ag|dm|kn|ai|vg|ky|ms|tc|fk|gi|mt|cy|is|li|mc|ad|sm|va|lu|mo|hk|sg|my|th|\
ph|id|vn|kh|la|mm|bn|pk|bd|lk|np|af|ir|iq|sa|ae|kw|bh|qa|om|ye|jo|lb|sy|il|ps|eg|ly|tn|dz|\
ma|mr|sn|ml|bf|ne|td|sd|er|et|dj|so|ke|ug|rw|bi|tz|zm|mw|mz|ao|na|bw|sz|ls|mg|mu|sc|km|yt|\
re|sh|ac|gs|tf|aq|bv|hm|sj|um|as|gu|mp|pr|vi|fm|mh|pw|ck|nu|pn|tk|to|tv|vu|ws|nf|nr|ki|sb|\
pg|fj|nc|pf|wf|eh|ax|gg|je|im|fo|gl|pm|bl|mf|dev";

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://([a-zA-Z0-9.-]+\.[a-zA-Z]{2,})").expect("url regex"));

static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"([a-zA-Z0-9.-]+\.(?:{TLD_TOKENS}))")).expect("domain regex")
});

static LEADING_COUNTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\(\d\)\s]+").expect("counter regex"));

static GOOGLE_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bgoogle\b").expect("google regex"));

pub fn is_browser_application(application: &str) -> bool {
    let app_lower = application.to_lowercase();
    BROWSER_APPLICATIONS
        .iter()
        .any(|browser| app_lower.contains(browser))
}

/// Infer `https://<domain>` from a browser window title. Returns None rather
/// than guessing.
pub fn url_from_title(title: &str, application: &str) -> Option<String> {
    if title.is_empty() || application.is_empty() || !is_browser_application(application) {
        return None;
    }
    domain_from_title(title).map(|domain| format!("https://{domain}"))
}

fn domain_from_title(title: &str) -> Option<String> {
    // An explicit URL in the title beats everything.
    if let Some(caps) = URL_RE.captures(title) {
        return Some(strip_www(&caps[1].to_lowercase()).to_string());
    }

    let title_lower = title.to_lowercase();

    // Bare word.tld with a recognised suffix.
    if let Some(caps) = DOMAIN_RE.captures(&title_lower) {
        return Some(strip_www(&caps[1]).to_string());
    }

    // "Site - Browser" / "Site - Description" patterns. The leading
    // parenthesised counter some sites prepend ("(2) Inbox") is dropped.
    let parts: Vec<&str> = title_lower.split(" - ").collect();
    let first_part = parts.first().map(|part| {
        LEADING_COUNTER_RE
            .replace(part.trim(), "")
            .trim()
            .to_string()
    });
    let second_part = parts
        .get(1)
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty() && !contains_browser_or_search_term(part));

    // Dictionary sites take priority over the bare-google rule so that
    // "Google - YouTube" resolves to the destination, not the search engine.
    for part in [&first_part, &second_part].into_iter().flatten() {
        if let Some(domain) = dictionary_match(part) {
            return Some(domain);
        }
    }
    for part in [&first_part, &second_part].into_iter().flatten() {
        if let Some(domain) = google_site_match(part) {
            return Some(domain);
        }
    }

    // Last pass: scrub browser names and search markers from the whole title
    // and retry once.
    let mut cleaned = title_lower;
    for term in BROWSER_AND_SEARCH_TERMS {
        cleaned = cleaned.replace(term, "");
    }
    if let Some(domain) = google_site_match(&cleaned) {
        return Some(domain);
    }
    dictionary_match(&cleaned)
}

fn dictionary_match(part: &str) -> Option<String> {
    SITE_DOMAINS
        .iter()
        .find(|(key, _)| part.contains(key))
        .map(|(_, domain)| (*domain).to_string())
}

/// "google" identifies google.com only as a standalone word, and never when
/// the text is really naming the browser or a search page.
fn google_site_match(text: &str) -> Option<String> {
    if text.contains("google chrome") || text.contains("google search") || text.contains("chromium")
    {
        return None;
    }
    if GOOGLE_WORD_RE.is_match(text) {
        return Some("google.com".to_string());
    }
    None
}

fn contains_browser_or_search_term(text: &str) -> bool {
    BROWSER_AND_SEARCH_TERMS.iter().any(|term| text.contains(term))
}

fn strip_www(domain: &str) -> &str {
    domain.strip_prefix("www.").unwrap_or(domain)
}
