use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use color_eyre::eyre::Result;
use rand::RngCore as _;

/// Bytes of entropy per secret
const SECRET_LEN: usize = 32;

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let access = generate_secret();
    let refresh = generate_secret();

    println!("Generated token signing secrets.");
    println!("Add the following to your .env file:");
    println!();
    println!("ACCESS_TOKEN_SECRET=\"{}\"", access);
    println!("REFRESH_TOKEN_SECRET=\"{}\"", refresh);

    Ok(())
}
