use anyhow::Result;

/// 支持的下载源协议
pub const SCHEMES: &[&str] = &["ftp", "ftps", "file", "sim"];

pub fn is_valid_source(source: &str) -> bool {
    match url::Url::parse(source) {
        Ok(url) => SCHEMES.contains(&url.scheme()) && url.path() != "",
        Err(_) => false,
    }
}

pub fn validate_thread_count(threads: usize) -> Result<()> {
    if threads == 0 {
        anyhow::bail!("并发数必须大于0");
    }
    Ok(())
}

pub fn validate_piece_size(size: u64) -> Result<()> {
    if size == 0 {
        anyhow::bail!("分片大小必须大于0");
    }
    Ok(())
}

pub fn validate_sources(sources: &[String]) -> Result<()> {
    if sources.is_empty() {
        anyhow::bail!("未提供任何下载源。请通过命令行参数或文件提供至少一个下载源。");
    }
    if let Some(bad) = sources.iter().find(|s| !is_valid_source(s)) {
        anyhow::bail!("无效的下载源: {}（支持 {}）", bad, SCHEMES.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_validation() {
        assert!(is_valid_source("file:///srv/a.bin"));
        assert!(is_valid_source("sim://demo/big.bin?size=100"));
        assert!(is_valid_source("ftp://user:pw@host:2121/pub/x"));
        assert!(is_valid_source("ftps://host/pub/x"));
        assert!(!is_valid_source("https://example.com/a"));
        assert!(!is_valid_source("invalid-url"));
    }

    #[test]
    fn test_thread_count_validation() {
        assert!(validate_thread_count(1).is_ok());
        assert!(validate_thread_count(64).is_ok());
        assert!(validate_thread_count(0).is_err());
    }

    #[test]
    fn test_piece_size_validation() {
        assert!(validate_piece_size(1).is_ok());
        assert!(validate_piece_size(0).is_err());
    }

    #[test]
    fn test_sources_validation() {
        let valid = vec!["file:///a".to_string(), "sim://h/b".to_string()];
        assert!(validate_sources(&valid).is_ok());

        let invalid = vec!["invalid-url".to_string(), "file:///a".to_string()];
        assert!(validate_sources(&invalid).is_err());
        assert!(validate_sources(&[]).is_err());
    }
}
