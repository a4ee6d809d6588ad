use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};

use log::info;

use crate::{RolloutId, rollout::RolloutData};

/// Writes the training data of one rollout to disk.
///
/// # Arguments
/// * `template` - The destination path, `{rollout_id}` and `{rank}` get substituted.
/// * `rollout_id` - The rollout the data belongs to.
/// * `rank` - This data-parallel rank.
/// * `data` - The data to dump.
///
/// # Returns
/// The path written to, or an io error.
pub fn save_debug_train_data(
    template: &str,
    rollout_id: RolloutId,
    rank: usize,
    data: &RolloutData,
) -> io::Result<PathBuf> {
    let path = PathBuf::from(
        template
            .replace("{rollout_id}", &rollout_id.to_string())
            .replace("{rank}", &rank.to_string()),
    );

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut writer = io::BufWriter::new(fs::File::create(&path)?);
    serde_json::to_writer(&mut writer, data)?;
    writer.flush()?;

    info!("saved debug train data to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout::RolloutBatch;

    #[test]
    fn substitutes_template_fields() {
        let root = std::env::temp_dir().join(format!("train_actor_dump_{}", std::process::id()));
        let template = format!("{}/{{rollout_id}}/rank_{{rank}}.json", root.display());
        let data = RolloutData::new(12, RolloutBatch::default(), 3, 4);

        let path = save_debug_train_data(&template, 12, 3, &data).unwrap();
        assert_eq!(path, root.join("12").join("rank_3.json"));

        let read: RolloutData = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(read, data);

        fs::remove_dir_all(&root).unwrap();
    }
}
