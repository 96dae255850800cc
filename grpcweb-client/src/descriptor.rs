//! Descriptor store: the schema pool plus a method index keyed by dispatch
//! path (`/package.Service/Method`).

use std::collections::{HashMap, HashSet};

use prost_reflect::{DescriptorPool, MethodDescriptor};
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use serde::Serialize;

use crate::ClientError;

/// Summary of one registered method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodInfo {
    pub package: String,
    pub service: String,
    pub name: String,
    pub full_method: String,
    pub is_client_stream: bool,
    pub is_server_stream: bool,
}

impl MethodInfo {
    fn from_descriptor(method: &MethodDescriptor) -> Self {
        let service = method.parent_service();
        Self {
            package: service.parent_file().package_name().to_string(),
            service: service.name().to_string(),
            name: method.name().to_string(),
            full_method: dispatch_path(method),
            is_client_stream: method.is_client_streaming(),
            is_server_stream: method.is_server_streaming(),
        }
    }
}

/// `/package.Service/Method` for a method.
pub fn dispatch_path(method: &MethodDescriptor) -> String {
    format!("/{}/{}", method.parent_service().full_name(), method.name())
}

/// Schema pool and method index of one client.
#[derive(Debug, Clone, Default)]
pub struct DescriptorStore {
    pool: DescriptorPool,
    methods: HashMap<String, MethodDescriptor>,
}

impl DescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a descriptor set and index every method it declares.
    ///
    /// Files already in the pool (by name) are kept as they are. Returns the
    /// methods declared by the set's files, sorted by dispatch path.
    pub fn register(&mut self, set: FileDescriptorSet) -> Result<Vec<MethodInfo>, ClientError> {
        let names: Vec<String> = set.file.iter().map(|f| f.name().to_string()).collect();

        let fresh: Vec<FileDescriptorProto> = set
            .file
            .into_iter()
            .filter(|f| self.pool.get_file_by_name(f.name()).is_none())
            .collect();
        if !fresh.is_empty() {
            self.pool
                .add_file_descriptor_protos(fresh)
                .map_err(|e| ClientError::Parse(e.to_string()))?;
        }

        let mut infos = Vec::new();
        for name in &names {
            let Some(file) = self.pool.get_file_by_name(name) else {
                continue;
            };
            for service in file.services() {
                for method in service.methods() {
                    let path = dispatch_path(&method);
                    infos.push(MethodInfo::from_descriptor(&method));
                    self.methods.insert(path, method);
                }
            }
        }
        infos.sort_by(|a, b| a.full_method.cmp(&b.full_method));
        infos.dedup();
        Ok(infos)
    }

    /// Look up a method by dispatch path.
    pub fn get(&self, path: &str) -> Option<&MethodDescriptor> {
        self.methods.get(path)
    }

    /// Look up a method, failing with [`ClientError::MethodNotFound`].
    pub fn resolve(&self, path: &str) -> Result<MethodDescriptor, ClientError> {
        self.get(path)
            .cloned()
            .ok_or_else(|| ClientError::MethodNotFound(path.to_string()))
    }

    /// Summaries of every registered method, sorted by dispatch path.
    pub fn methods(&self) -> Vec<MethodInfo> {
        let mut infos: Vec<MethodInfo> =
            self.methods.values().map(MethodInfo::from_descriptor).collect();
        infos.sort_by(|a, b| a.full_method.cmp(&b.full_method));
        infos
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }
}

/// Order `files` so each one follows the files it imports.
///
/// Files are visited in name order with an explicit stack and a visited set
/// keyed by file name, so import cycles terminate. The first file seen under
/// a name wins; imports missing from `files` are skipped.
pub fn walk_file_descriptors<I>(files: I) -> FileDescriptorSet
where
    I: IntoIterator<Item = FileDescriptorProto>,
{
    let mut by_name: HashMap<String, FileDescriptorProto> = HashMap::new();
    for file in files {
        by_name.entry(file.name().to_string()).or_insert(file);
    }
    let mut roots: Vec<String> = by_name.keys().cloned().collect();
    roots.sort();

    let mut visited = HashSet::new();
    let mut ordered = Vec::with_capacity(by_name.len());
    for root in roots {
        // (file name, imports already pushed)
        let mut stack = vec![(root, false)];
        while let Some((name, expanded)) = stack.pop() {
            if expanded {
                if let Some(file) = by_name.remove(&name) {
                    ordered.push(file);
                }
                continue;
            }
            if !visited.insert(name.clone()) {
                continue;
            }
            let imports = by_name
                .get(&name)
                .map(|f| f.dependency.clone())
                .unwrap_or_default();
            stack.push((name, true));
            for import in imports.into_iter().rev() {
                if !visited.contains(&import) && by_name.contains_key(&import) {
                    stack.push((import, false));
                }
            }
        }
    }

    FileDescriptorSet { file: ordered }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_types::{
        FileDescriptorProto, MethodDescriptorProto, ServiceDescriptorProto, DescriptorProto,
    };

    fn file(name: &str, package: &str, service: &str, methods: &[(&str, bool)]) -> FileDescriptorProto {
        FileDescriptorProto {
            name: Some(name.into()),
            package: Some(package.into()),
            syntax: Some("proto3".into()),
            message_type: vec![DescriptorProto {
                name: Some("Msg".into()),
                ..Default::default()
            }],
            service: vec![ServiceDescriptorProto {
                name: Some(service.into()),
                method: methods
                    .iter()
                    .map(|(m, server_streaming)| MethodDescriptorProto {
                        name: Some((*m).into()),
                        input_type: Some(format!(".{package}.Msg")),
                        output_type: Some(format!(".{package}.Msg")),
                        server_streaming: Some(*server_streaming),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn set(files: Vec<FileDescriptorProto>) -> FileDescriptorSet {
        FileDescriptorSet { file: files }
    }

    #[test]
    fn test_register_indexes_by_dispatch_path() {
        let mut store = DescriptorStore::new();
        let infos = store
            .register(set(vec![file(
                "weather.proto",
                "weather",
                "WeatherService",
                &[("GetWeather", false), ("WatchWeather", true)],
            )]))
            .unwrap();

        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].full_method, "/weather.WeatherService/GetWeather");
        assert_eq!(infos[0].package, "weather");
        assert_eq!(infos[0].service, "WeatherService");
        assert!(!infos[0].is_server_stream);
        assert!(infos[1].is_server_stream);

        let method = store.get("/weather.WeatherService/GetWeather").unwrap();
        assert_eq!(method.input().full_name(), "weather.Msg");
    }

    #[test]
    fn test_register_is_additive_and_idempotent() {
        let mut store = DescriptorStore::new();
        let a = file("a.proto", "pkg.a", "A", &[("One", false)]);
        let b = file("b.proto", "pkg.b", "B", &[("Two", false)]);

        store.register(set(vec![a.clone()])).unwrap();
        store.register(set(vec![b])).unwrap();
        assert_eq!(store.len(), 2);

        let again = store.register(set(vec![a])).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(store.len(), 2);
        assert!(store.get("/pkg.a.A/One").is_some());
        assert!(store.get("/pkg.b.B/Two").is_some());
    }

    #[test]
    fn test_resolve_unknown_method() {
        let store = DescriptorStore::new();
        let err = store.resolve("/pkg.Svc/NoSuchMethod").unwrap_err();
        assert!(matches!(err, ClientError::MethodNotFound(ref p) if p == "/pkg.Svc/NoSuchMethod"));
    }

    #[test]
    fn test_register_rejects_broken_set() {
        let mut store = DescriptorStore::new();
        let mut broken = file("broken.proto", "broken", "Svc", &[("Call", false)]);
        broken.dependency.push("missing.proto".into());
        assert!(matches!(
            store.register(set(vec![broken])),
            Err(ClientError::Parse(_))
        ));
    }

    #[test]
    fn test_stores_are_isolated() {
        let mut first = DescriptorStore::new();
        let mut second = DescriptorStore::new();
        first
            .register(set(vec![file("a.proto", "a", "A", &[("Call", false)])]))
            .unwrap();
        second
            .register(set(vec![file("b.proto", "b", "B", &[("Call", false)])]))
            .unwrap();

        assert!(first.get("/b.B/Call").is_none());
        assert!(second.get("/a.A/Call").is_none());
    }

    #[test]
    fn test_walk_orders_dependencies_first() {
        let mut base = file("base.proto", "base", "Base", &[]);
        base.service.clear();
        let mut mid = file("mid.proto", "mid", "Mid", &[("Call", false)]);
        mid.dependency.push("base.proto".into());
        let mut top = file("top.proto", "top", "Top", &[("Call", false)]);
        top.dependency.push("mid.proto".into());
        top.dependency.push("base.proto".into());

        let walked = walk_file_descriptors([top, mid.clone(), base, mid]);
        let names: Vec<&str> = walked.file.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["base.proto", "mid.proto", "top.proto"]);

        let mut store = DescriptorStore::new();
        assert_eq!(store.register(walked).unwrap().len(), 2);
    }

    #[test]
    fn test_walk_terminates_on_import_cycle() {
        let mut a = file("a.proto", "a", "A", &[]);
        a.dependency.push("b.proto".into());
        let mut b = file("b.proto", "b", "B", &[]);
        b.dependency.push("a.proto".into());
        let mut c = file("c.proto", "c", "C", &[]);
        c.dependency.push("a.proto".into());
        c.dependency.push("missing.proto".into());

        let walked = walk_file_descriptors([c, b, a]);
        let names: Vec<&str> = walked.file.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["b.proto", "a.proto", "c.proto"]);
    }
}
