use std::io::{self, IsTerminal, Write};

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use crate::archive::Credentials;
use crate::error::XnatError;

/// Reads a password from the terminal without echoing it.
pub fn read_password(prompt: &str) -> Result<String, XnatError> {
    if !io::stdin().is_terminal() {
        let mut line = String::new();
        io::stdin().read_line(&mut line).map_err(XnatError::fs)?;
        return Ok(line.trim_end_matches(['\r', '\n']).to_string());
    }

    let mut stderr = io::stderr();
    write!(stderr, "{prompt}").map_err(XnatError::fs)?;
    stderr.flush().map_err(XnatError::fs)?;

    enable_raw_mode().map_err(XnatError::fs)?;
    let result = read_hidden_line();
    let _ = disable_raw_mode();
    let _ = writeln!(stderr);
    result
}

fn read_hidden_line() -> Result<String, XnatError> {
    let mut password = String::new();
    loop {
        let Event::Key(key) = event::read().map_err(XnatError::fs)? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Enter => return Ok(password),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Err(XnatError::Cancelled);
            }
            KeyCode::Esc => return Err(XnatError::Cancelled),
            KeyCode::Backspace => {
                password.pop();
            }
            KeyCode::Char(ch) => password.push(ch),
            _ => {}
        }
    }
}

/// Builds credentials from an explicit user and an optional password,
/// prompting for the password when it is missing. No user means anonymous
/// access.
pub fn resolve_credentials(
    user: Option<String>,
    password: Option<String>,
) -> Result<Option<Credentials>, XnatError> {
    let Some(user) = user.filter(|user| !user.trim().is_empty()) else {
        return Ok(None);
    };
    let password = match password {
        Some(password) => password,
        None => read_password(&format!("Password for {user}: "))?,
    };
    Ok(Some(Credentials { user, password }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_user_means_anonymous() {
        assert!(resolve_credentials(None, None).unwrap().is_none());
        assert!(
            resolve_credentials(Some("  ".to_string()), None)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn explicit_password_skips_prompt() {
        let credentials = resolve_credentials(Some("alice".to_string()), Some("pw".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(credentials.user, "alice");
        assert_eq!(credentials.password, "pw");
    }
}
