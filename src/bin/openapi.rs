//! Print the OpenAPI spec for the portal API.

use anyhow::Result;

fn main() -> Result<()> {
    let spec = staffdesk::api::openapi();
    println!("{}", spec.to_pretty_json()?);
    Ok(())
}
