use crate::core::instance::LoaderKind;

/// Version id under which the provider files a game version + loader pair.
pub(crate) fn profile_id_for_loader(
    loader: LoaderKind,
    minecraft_version: &str,
    loader_version: &str,
) -> String {
    match loader {
        LoaderKind::Fabric => format!("fabric-loader-{loader_version}-{minecraft_version}"),
        LoaderKind::Quilt => format!("quilt-loader-{loader_version}-{minecraft_version}"),
        LoaderKind::Vanilla => minecraft_version.to_string(),
    }
}
