//! DOI-prefix to publisher-name mapping.

/// Known DOI registrant prefixes and the publishers behind them.
const DOI_PREFIX_TO_PUBLISHER: &[(&str, &str)] = &[
    ("10.1007", "Springer"),
    ("10.1016", "Elsevier"),
    ("10.1109", "IEEE"),
    ("10.1090", "AMS"),
    ("10.1137", "SIAM"),
    ("10.1080", "Taylor & Francis"),
    ("10.1093", "Oxford University Press"),
    ("10.1017", "Cambridge University Press"),
    ("10.3390", "MDPI"),
    ("10.1088", "IOP Publishing"),
    ("10.1038", "Nature Publishing Group"),
    ("10.1126", "Science/AAAS"),
    ("10.1145", "ACM"),
    ("10.1002", "Wiley"),
    ("10.1215", "Duke University Press"),
    ("10.4171", "EMS Press"),
    ("10.1201", "CRC Press"),
    ("10.1112", "London Mathematical Society"),
    ("10.2307", "JSTOR"),
    ("10.4213", "Russian Academy of Sciences"),
    ("10.1134", "Pleiades Publishing"),
    ("10.3842", "Institute of Mathematics of NAS of Ukraine"),
    ("10.48550", "arXiv"),
];

/// Returns the publisher name for a DOI, or `"Unknown"` for unmapped
/// prefixes.
///
/// # Examples
///
/// ```
/// use paperfetch_core::publisher::publisher_for_doi;
///
/// assert_eq!(publisher_for_doi("10.1007/s11784-025-01219-x"), "Springer");
/// assert_eq!(publisher_for_doi("10.9999/unknown"), "Unknown");
/// ```
#[must_use]
pub fn publisher_for_doi(doi: &str) -> &'static str {
    let prefix = doi.split('/').next().unwrap_or(doi);
    DOI_PREFIX_TO_PUBLISHER
        .iter()
        .find(|(p, _)| *p == prefix)
        .map_or("Unknown", |(_, name)| name)
}
