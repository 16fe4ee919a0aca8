/// Parses a manifest file into the ordered list of series UIDs to fetch.
///
/// Lines containing `=` are header/comment lines (`downloadServerUrl=...`,
/// `includeAnnotation=true`, etc.) and are ignored. All other non-empty lines,
/// after trimming surrounding whitespace, are taken as series UIDs verbatim.
/// A manifest with zero UIDs is not an error: the run simply completes with
/// every counter at zero.
pub fn parse(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains('='))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_header_lines_and_blanks() {
        let manifest = "downloadServerUrl=https://example.test\n\
                         includeAnnotation=false\n\
                         \n\
                         1.2.3.4.5\n\
                         1.2.3.4.6\n";
        let uids = parse(manifest);
        assert_eq!(uids, vec!["1.2.3.4.5", "1.2.3.4.6"]);
    }

    #[test]
    fn trims_whitespace() {
        let manifest = "  1.2.3  \n\t1.2.4\t\n";
        let uids = parse(manifest);
        assert_eq!(uids, vec!["1.2.3", "1.2.4"]);
    }

    #[test]
    fn manifest_with_only_header_lines_yields_zero_uids() {
        let uids = parse("downloadServerUrl=https://example.test\n");
        assert!(uids.is_empty());
    }

    #[test]
    fn manifest_with_only_uids_has_no_header() {
        let manifest = "1.2.3\n1.2.4\n1.2.5\n";
        let uids = parse(manifest);
        assert_eq!(uids.len(), 3);
    }
}
