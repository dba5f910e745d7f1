//! Browser label for the session list, derived from the User-Agent

/// (token in the User-Agent, label). Order matters: Chromium forks carry
/// `Chrome/` and most browsers carry `Safari/`, so specific tokens go first.
const BROWSERS: &[(&str, &str)] = &[
    ("EdgA/", "Edge Mobile"),
    ("Edg/", "Edge"),
    ("OPR/", "Opera"),
    ("OPT/", "Opera Mobile"),
    ("SamsungBrowser/", "Samsung Browser"),
    ("Brave", "Brave"),
    ("Vivaldi/", "Vivaldi"),
    ("Zen/", "Zen"),
    ("Arc/", "Arc"),
    ("Ladybird", "LadyBird"),
    ("CriOS/", "Chrome Mobile"),
    ("FxiOS/", "Firefox Mobile"),
    ("Firefox/", "Firefox"),
    ("MSIE ", "Internet Explorer"),
    ("Trident/", "Internet Explorer"),
    ("Chrome/", "Chrome"),
];

pub fn parse_browser(user_agent: &str) -> &'static str {
    for (token, label) in BROWSERS {
        if user_agent.contains(token) {
            return match *label {
                "Chrome" if user_agent.contains("Mobile") => "Chrome Mobile",
                "Firefox" if user_agent.contains("Mobile") => "Firefox Mobile",
                other => other,
            };
        }
    }
    if user_agent.contains("Safari/") {
        if user_agent.contains("Mobile") {
            return "Mobile Safari";
        }
        return "Safari";
    }
    "Unknown Browser"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desktop_browsers() {
        let chrome = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
        assert_eq!(parse_browser(chrome), "Chrome");
        let edge = "Mozilla/5.0 (Windows NT 10.0) AppleWebKit/537.36 Chrome/120.0 Safari/537.36 Edg/120.0";
        assert_eq!(parse_browser(edge), "Edge");
        let opera = "Mozilla/5.0 AppleWebKit/537.36 Chrome/119.0 Safari/537.36 OPR/105.0";
        assert_eq!(parse_browser(opera), "Opera");
        let firefox = "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";
        assert_eq!(parse_browser(firefox), "Firefox");
        let safari = "Mozilla/5.0 (Macintosh) AppleWebKit/605.1.15 Version/17.0 Safari/605.1.15";
        assert_eq!(parse_browser(safari), "Safari");
        assert_eq!(parse_browser("Mozilla/4.0 (compatible; MSIE 8.0)"), "Internet Explorer");
    }

    #[test]
    fn test_mobile_browsers() {
        let iphone = "Mozilla/5.0 (iPhone) AppleWebKit/605.1.15 Version/17.0 Mobile/15E148 Safari/604.1";
        assert_eq!(parse_browser(iphone), "Mobile Safari");
        let android = "Mozilla/5.0 (Linux; Android 14) AppleWebKit/537.36 Chrome/120.0 Mobile Safari/537.36";
        assert_eq!(parse_browser(android), "Chrome Mobile");
        let samsung = "Mozilla/5.0 (Linux; Android 14) SamsungBrowser/23.0 Chrome/115.0 Mobile Safari/537.36";
        assert_eq!(parse_browser(samsung), "Samsung Browser");
        let edga = "Mozilla/5.0 (Linux; Android 14) Chrome/120.0 Mobile Safari/537.36 EdgA/120.0";
        assert_eq!(parse_browser(edga), "Edge Mobile");
    }

    #[test]
    fn test_unknown() {
        assert_eq!(parse_browser(""), "Unknown Browser");
        assert_eq!(parse_browser("curl/8.0"), "Unknown Browser");
    }
}
