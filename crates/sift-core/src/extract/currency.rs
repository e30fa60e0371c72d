//! Currency symbol and ISO code detection next to amounts

/// ISO 4217 codes recognized when written next to a number
pub const ISO_CODES: &[&str] = &[
    "USD", "EUR", "GBP", "JPY", "CAD", "AUD", "CHF", "CNY", "INR", "MXN",
];

/// Map a currency marker (symbol or ISO code) to its ISO 4217 code
pub fn code_for(marker: &str) -> Option<&'static str> {
    let marker = marker.trim();
    let code = match marker {
        "$" | "US$" => "USD",
        "C$" => "CAD",
        "A$" => "AUD",
        "MX$" => "MXN",
        "€" => "EUR",
        "£" => "GBP",
        "¥" => "JPY",
        "₹" => "INR",
        other => {
            let upper = other.to_uppercase();
            return ISO_CODES.iter().copied().find(|c| *c == upper);
        }
    };
    Some(code)
}

/// Display symbol for a code, falling back to the code itself
pub fn symbol_for(code: &str) -> &str {
    match code {
        "USD" => "$",
        "CAD" => "C$",
        "AUD" => "A$",
        "MXN" => "MX$",
        "EUR" => "€",
        "GBP" => "£",
        "JPY" => "¥",
        "INR" => "₹",
        other => other,
    }
}
