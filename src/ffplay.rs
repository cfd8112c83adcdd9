use std::{cell::RefCell, process::Stdio, rc::Rc};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::OutputError;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FFplayLocation {
    NotChecked,
    SystemEnvPath,
    CurrentDir,
    NotFound,
}

impl FFplayLocation {
    pub fn ffplay_path(&self) -> &str {
        match self {
            FFplayLocation::NotChecked => "",
            FFplayLocation::SystemEnvPath => "ffplay",
            FFplayLocation::CurrentDir => "./ffplay",
            FFplayLocation::NotFound => "",
        }
    }
}

async fn check_ffplay_exists() -> Result<FFplayLocation, anyhow::Error> {
    let env_path = FFplayLocation::SystemEnvPath.ffplay_path();
    match Command::new(env_path)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(_) => return Ok(FFplayLocation::SystemEnvPath),
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
    }

    let local = FFplayLocation::CurrentDir.ffplay_path();
    debug!("checking for file {}", local);
    match tokio::fs::metadata(local).await {
        Ok(attr) if attr.is_file() => Ok(FFplayLocation::CurrentDir),
        Ok(_) => Ok(FFplayLocation::NotFound),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(FFplayLocation::NotFound),
        Err(err) => Err(err.into()),
    }
}

/// Starts an audio-only ffplay reading from stdin.
pub async fn spawn_ffplay(
    copy_ended: Rc<RefCell<bool>>,
    title: &str,
    ffplay_location: Rc<RefCell<FFplayLocation>>,
) -> Result<tokio::process::ChildStdin, anyhow::Error> {
    if *ffplay_location.borrow() == FFplayLocation::NotChecked {
        let found = check_ffplay_exists().await?;
        *ffplay_location.borrow_mut() = found;
    }
    if *ffplay_location.borrow() == FFplayLocation::NotFound {
        return Err(OutputError::FFplayNotFound.into());
    }

    let path = ffplay_location.borrow().ffplay_path().to_string();
    let mut cmd = Command::new(path);
    cmd.arg("-window_title")
        .arg(title)
        .arg("-nodisp")
        .arg("-fflags")
        .arg("nobuffer")
        .arg("-autoexit")
        .arg("-i")
        .arg("-");
    cmd.stdout(Stdio::null())
        .stderr(Stdio::null())
        .stdin(Stdio::piped());

    let mut child = cmd.spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("ffplay child has no stdin"))?;
    info!("ffplay started");

    tokio::task::spawn_local(async move {
        match child.wait().await {
            Ok(status) => debug!("ffplay exited: {}", status),
            Err(err) => warn!("ffplay wait failed: {}", err),
        }
        *copy_ended.borrow_mut() = true;
    });

    Ok(stdin)
}
