use crate::capture_loop::PagingAction;
use crate::desktop::{PageKey, Point};
use crate::folders::{parse_selection, FolderInfo, Selection};
use crate::megacmd::Credentials;
use anyhow::{anyhow, Context, Result};
use dialoguer::{Confirm, Input, Password, Select};

/// Output folder names are restricted so they survive as remote paths.
pub fn validate_folder_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("folder name is empty".to_string());
    }
    if name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Ok(())
    } else {
        Err("use only letters, digits, underscore (_) and hyphen (-)".to_string())
    }
}

/// Parse `X,Y` screen coordinates.
pub fn parse_point(raw: &str) -> Result<Point> {
    let (x, y) = raw
        .split_once(',')
        .ok_or_else(|| anyhow!("expected X,Y but got `{raw}`"))?;
    let x = x
        .trim()
        .parse::<i32>()
        .with_context(|| format!("invalid X coordinate `{}`", x.trim()))?;
    let y = y
        .trim()
        .parse::<i32>()
        .with_context(|| format!("invalid Y coordinate `{}`", y.trim()))?;
    Ok(Point { x, y })
}

pub fn folder_name() -> Result<String> {
    println!("Name the output folder (e.g. market_wizards).");
    let name: String = Input::new()
        .with_prompt("Folder name")
        .validate_with(|input: &String| validate_folder_name(input.trim()))
        .interact_text()
        .context("folder name prompt failed")?;
    Ok(name.trim().to_string())
}

pub fn paging_action() -> Result<PagingAction> {
    let items = [
        "Left arrow key",
        "Right arrow key",
        "Click custom coordinates",
    ];
    let choice = Select::new()
        .with_prompt("How should pages be advanced?")
        .items(&items)
        .default(1)
        .interact()
        .context("paging action prompt failed")?;

    let action = match choice {
        0 => PagingAction::Key { key: PageKey::Left },
        1 => PagingAction::Key {
            key: PageKey::Right,
        },
        _ => {
            let x: i32 = Input::new()
                .with_prompt("X coordinate")
                .interact_text()
                .context("X coordinate prompt failed")?;
            let y: i32 = Input::new()
                .with_prompt("Y coordinate")
                .interact_text()
                .context("Y coordinate prompt failed")?;
            PagingAction::Click {
                at: Point { x, y },
            }
        }
    };
    Ok(action)
}

pub fn confirm(prompt: &str, default: bool) -> Result<bool> {
    Confirm::new()
        .with_prompt(prompt)
        .default(default)
        .interact()
        .context("confirmation prompt failed")
}

pub fn credentials() -> Result<Credentials> {
    println!("(Create an account at https://mega.nz if you do not have one.)");
    let email: String = Input::new()
        .with_prompt("MEGA email")
        .allow_empty(true)
        .interact_text()
        .context("email prompt failed")?;
    let password = Password::new()
        .with_prompt("MEGA password")
        .allow_empty_password(true)
        .interact()
        .context("password prompt failed")?;
    Ok(Credentials { email, password })
}

/// Re-prompts until the expression parses against `candidates`.
pub fn folder_selection(candidates: &[FolderInfo]) -> Result<Selection> {
    let max = candidates.len();
    let raw: String = Input::new()
        .with_prompt("Select folders (e.g. 1 / 1,3 / 2-5 / all / q)")
        .validate_with(move |input: &String| {
            parse_selection(input, max)
                .map(|_| ())
                .map_err(|err| err.to_string())
        })
        .interact_text()
        .context("selection prompt failed")?;
    parse_selection(&raw, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_names_are_restricted() {
        assert!(validate_folder_name("market_wizards").is_ok());
        assert!(validate_folder_name("Vol-2").is_ok());
        assert!(validate_folder_name("").is_err());
        assert!(validate_folder_name("two words").is_err());
        assert!(validate_folder_name("../escape").is_err());
        assert!(validate_folder_name("本").is_err());
    }

    #[test]
    fn points_parse_with_spaces() {
        assert_eq!(parse_point("279,1084").unwrap(), Point { x: 279, y: 1084 });
        assert_eq!(parse_point(" -5 , 10 ").unwrap(), Point { x: -5, y: 10 });
        assert!(parse_point("279").is_err());
        assert!(parse_point("a,1").is_err());
    }
}
