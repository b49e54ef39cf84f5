/// List every capability the runtime would expose to a run.
pub async fn list() -> anyhow::Result<()> {
    let (config, _paths) = super::load_config()?;
    let registry = super::build_registry(&config).await?;
    let descriptors = registry.descriptors();

    println!();
    println!("Registered capabilities ({} total)", descriptors.len());
    println!();
    for descriptor in &descriptors {
        let short_desc: String = descriptor.description.chars().take(60).collect();
        let ellipsis = if descriptor.description.chars().count() > 60 { "..." } else { "" };
        println!("  {:<32} {}{}", descriptor.name, short_desc, ellipsis);
        if let Some(required) = descriptor.input_schema.get("required").and_then(|r| r.as_array()) {
            let names: Vec<&str> = required.iter().filter_map(|v| v.as_str()).collect();
            if !names.is_empty() {
                println!("  {:<32} required: {}", "", names.join(", "));
            }
        }
    }
    println!();
    Ok(())
}
