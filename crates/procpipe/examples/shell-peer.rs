//! Exchange bytes with a shell child that knows only our pid and fds.
//!
//! Run with:
//!   cargo run --example shell-peer
//!
//! The child writes through `/proc/<pid>/fd/<write_fd>` and reads through
//! `/proc/<pid>/fd/<read_fd>`; it never inherits the pipe itself.

use std::process::Command;

use procpipe::pipe::PipeContext;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let context = PipeContext::new()?;
    let identity = context.identity();
    eprintln!("{identity}");

    // Child -> parent.
    let status = Command::new("sh")
        .arg("-c")
        .arg(format!(
            "printf 'hello from %s' $$ > /proc/{}/fd/{}",
            identity.pid, identity.write_fd
        ))
        .status()?;
    if !status.success() {
        return Err(format!("writer child failed: {status}").into());
    }
    let chunk = context.read()?;
    eprintln!("Received: {}", String::from_utf8_lossy(&chunk));

    // Parent -> child.
    let reply = b"hello back";
    context.write(reply)?;
    let output = Command::new("head")
        .arg("-c")
        .arg(reply.len().to_string())
        .arg(format!("/proc/{}/fd/{}", identity.pid, identity.read_fd))
        .output()?;
    eprintln!("Child read: {}", String::from_utf8_lossy(&output.stdout));

    Ok(())
}
