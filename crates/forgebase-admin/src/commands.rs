use std::io::{self, Write};

use anyhow::{bail, Result};
use tracing::warn;

use forgebase_session::{Access, AdminClient, ApiRequest, Config, SessionEvent, SignupProfile};

pub const USAGE: &str = "\
Usage: forgebase-admin <command>

Commands:
  login [email]   Sign in (password from FORGEBASE_PASSWORD or prompt)
  signup          Create an account and sign in
  logout          Sign out and forget the saved session
  whoami          Show the signed-in user
  status          Show session state
  health          Check the backend
  get <path>      Authenticated GET, prints the JSON response";

#[derive(Debug)]
pub enum Command {
    Login { email: Option<String> },
    Signup,
    Logout,
    Whoami,
    Status,
    Health,
    Get { path: String },
}

impl Command {
    pub fn parse(args: &[String]) -> Option<Self> {
        let mut args = args.iter().map(String::as_str);
        let command = match args.next()? {
            "login" => Command::Login {
                email: args.next().map(str::to_string),
            },
            "signup" => Command::Signup,
            "logout" => Command::Logout,
            "whoami" => Command::Whoami,
            "status" => Command::Status,
            "health" => Command::Health,
            "get" => Command::Get {
                path: args.next()?.to_string(),
            },
            _ => return None,
        };
        Some(command)
    }
}

pub async fn run(command: Command, client: &AdminClient, config: &mut Config) -> Result<()> {
    match command {
        Command::Login { email } => login(client, config, email).await,
        Command::Signup => signup(client).await,
        Command::Logout => {
            client.logout().await;
            println!("Logged out.");
            Ok(())
        }
        Command::Whoami => match client.current_user() {
            Some(user) => {
                println!("{} <{}> ({})", user.display_name, user.email, user.id);
                Ok(())
            }
            None => bail!("Not logged in. Run `forgebase-admin login`."),
        },
        Command::Status => {
            status(client);
            Ok(())
        }
        Command::Health => {
            let health = client.health().await?;
            println!("{} (version {}, {})", health.status, health.version, health.timestamp);
            Ok(())
        }
        Command::Get { path } => get(client, &path).await,
    }
}

async fn login(client: &AdminClient, config: &mut Config, email: Option<String>) -> Result<()> {
    println!("\n=== ForgeBase Login ===\n");

    let email = match email.or_else(|| std::env::var("FORGEBASE_EMAIL").ok()) {
        Some(email) => email,
        None => prompt_with_default("Email", config.last_email.as_deref())?,
    };
    let password = match std::env::var("FORGEBASE_PASSWORD") {
        Ok(password) => password,
        Err(_) => rpassword::prompt_password("Password: ")?,
    };

    println!("\nAuthenticating...");
    match client.login(&email, &password).await {
        Ok(session) => {
            config.last_email = Some(email);
            if let Err(e) = config.save() {
                warn!(error = %e, "Failed to save config");
            }
            let name = session
                .user()
                .map(|u| u.display_name.as_str())
                .unwrap_or_default();
            println!("Login successful! Welcome, {}.\n", name);
            Ok(())
        }
        Err(e) => bail!(e.user_message("Login failed")),
    }
}

async fn signup(client: &AdminClient) -> Result<()> {
    println!("\n=== Create your ForgeBase account ===\n");

    let profile = SignupProfile {
        full_name: prompt("Full name")?,
        email: prompt("Email")?,
        password: rpassword::prompt_password("Password: ")?,
    };

    match client.signup(&profile).await {
        Ok(_) => {
            println!("Account created, you are now signed in.\n");
            Ok(())
        }
        Err(e) => bail!(e.user_message("Signup failed")),
    }
}

fn status(client: &AdminClient) {
    let session = client.session();
    match session.user() {
        Some(user) => {
            println!("Signed in as {} <{}>", user.display_name, user.email);
            if let Some(minutes) = session.minutes_until_expiry() {
                println!("Access token expires in {}m", minutes);
            }
        }
        None => println!("Not signed in"),
    }
    if let Some(ref error) = session.status.last_error {
        println!("Last error: {}", error);
    }
}

async fn get(client: &AdminClient, path: &str) -> Result<()> {
    if let Access::Redirect(login) = client.guard().check(path) {
        bail!("Not logged in (redirect to {}). Run `forgebase-admin login`.", login);
    }

    let mut events = client.events();
    let response = client.gateway().send(&ApiRequest::get(path)).await?;

    if let Ok(SessionEvent::Invalidated { reason }) = events.try_recv() {
        bail!("Session expired ({}). Please log in again.", reason);
    }

    match serde_json::from_str::<serde_json::Value>(&response.body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", response.body),
    }
    if !response.is_success() {
        bail!("Request failed with status {}", response.status);
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn prompt_with_default(label: &str, default: Option<&str>) -> Result<String> {
    let Some(default) = default else {
        return prompt(label);
    };
    let input = prompt(&format!("{} [{}]", label, default))?;
    if input.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(input)
    }
}
