use std::process::Command;

fn main() {
    let built_at = build_timestamp().unwrap_or_else(|| "unknown".into());
    let revision =
        run("git", &["rev-parse", "--short=10", "HEAD"]).unwrap_or_else(|| "unknown".into());

    println!("cargo:rustc-env=BUILD_TIMESTAMP={built_at}");
    println!("cargo:rustc-env=BUILD_GIT_SHA={revision}");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
}

/// ISO-8601 UTC build time. `SOURCE_DATE_EPOCH` pins it for reproducible
/// release builds.
fn build_timestamp() -> Option<String> {
    const FORMAT: &str = "+%Y-%m-%dT%H:%M:%SZ";
    let unix = match std::env::var("SOURCE_DATE_EPOCH") {
        Ok(epoch) => run("date", &["-u", "-d", &format!("@{epoch}"), FORMAT]),
        Err(_) => run("date", &["-u", FORMAT]),
    };
    unix.or_else(|| {
        run(
            "powershell",
            &[
                "-NoProfile",
                "-Command",
                "[DateTime]::UtcNow.ToString('yyyy-MM-ddTHH:mm:ssZ')",
            ],
        )
    })
}

/// Trimmed stdout of a command that exited cleanly.
fn run(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
