use git_url_parse::{GitUrl, Scheme};

use crate::error::{KeelError, KeelResult};

pub fn parse_git_url(url: &str) -> KeelResult<GitUrl> {
    let parsed = GitUrl::parse(url)?;
    if parsed.host.as_deref().unwrap_or_default().is_empty() {
        return Err(KeelError::BadRequest(format!(
            "unable to find the host of git url {:?}",
            url
        )));
    }
    Ok(parsed)
}

/// `{scheme}://{host}/{owner}/{repo}` of a remote; ssh style remotes become https.
fn browse_base(remote: &str) -> KeelResult<(String, String)> {
    let u = parse_git_url(remote)?;
    let host = u.host.clone().unwrap_or_default();
    let scheme = match u.scheme {
        Scheme::Http => "http",
        _ => "https",
    };
    let host = match (u.scheme, u.port) {
        (Scheme::Http | Scheme::Https, Some(port)) => format!("{}:{}", host, port),
        _ => host,
    };
    let path = u.path.trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path).trim_end_matches('/');
    Ok((host.clone(), format!("{}://{}/{}", scheme, host, path)))
}

/// Web URL of a commit: `/commit/{hash}` for most hosts and `/commits/{hash}` on Bitbucket.
pub fn make_commit_url(remote: &str, hash: &str) -> KeelResult<String> {
    let (host, base) = browse_base(remote)?;
    let segment = if host == "bitbucket.org" {
        "commits"
    } else {
        "commit"
    };
    Ok(format!("{}/{}/{}", base, segment, hash))
}

/// Web URL of a directory at a branch.
pub fn make_dir_url(remote: &str, dir: &str, branch: &str) -> KeelResult<String> {
    let (host, base) = browse_base(remote)?;
    let segment = if host == "bitbucket.org" { "src" } else { "tree" };
    let dir = dir.trim_matches('/');
    Ok(format!("{}/{}/{}/{}", base, segment, branch, dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_urls() {
        let cases = [
            ("git@github.com:org/repo.git", "https://github.com/org/repo/commit/abc"),
            ("git@gitlab.com:org/repo.git", "https://gitlab.com/org/repo/commit/abc"),
            ("git@bitbucket.org:org/repo.git", "https://bitbucket.org/org/repo/commits/abc"),
            ("git@foo.com:org/repo.git", "https://foo.com/org/repo/commit/abc"),
            ("git@github.com:org/repo", "https://github.com/org/repo/commit/abc"),
            ("git@github.com:org/repo/", "https://github.com/org/repo/commit/abc"),
            ("http://github.com/org/repo", "http://github.com/org/repo/commit/abc"),
            ("https://github.com/org/repo.git", "https://github.com/org/repo/commit/abc"),
        ];
        for (remote, want) in cases {
            assert_eq!(make_commit_url(remote, "abc").unwrap(), want, "{remote}");
        }
    }

    #[test]
    fn dir_urls() {
        assert_eq!(
            make_dir_url("git@github.com:org/repo.git", "path/to", "abc").unwrap(),
            "https://github.com/org/repo/tree/abc/path/to"
        );
        assert_eq!(
            make_dir_url("git@bitbucket.org:org/repo.git", "/path/to/", "abc").unwrap(),
            "https://bitbucket.org/org/repo/src/abc/path/to"
        );
    }

    #[test]
    fn unparseable_url() {
        assert!(make_commit_url("1234abcd", "abc").is_err());
    }
}
