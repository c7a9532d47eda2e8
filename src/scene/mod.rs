//! Scene management
//!
//! A [`Scene`] wraps a `bevy_ecs::World` holding the editor's entities. The
//! renderer only reads it through [`Scene::for_each_mesh`] and
//! [`Scene::for_each_light`]; it never owns entities.

mod camera;
mod light;
mod transform;

pub use camera::*;
pub use light::*;
pub use transform::*;

use crate::backend::MeshHandle;
use crate::resources::Material;
use bevy_ecs::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;

/// Scene shared between the editor and the renderer
pub type SharedScene = Rc<RefCell<Scene>>;

/// Display name of an entity
#[derive(Component, Debug, Clone, PartialEq, Eq)]
pub struct Tag(pub String);

/// Mesh reference. An empty path is not renderable; a path without a handle
/// is still loading. Either way the entity is skipped.
#[derive(Component, Debug, Clone, Default, PartialEq)]
pub struct MeshComponent {
    pub path: String,
    pub mesh: Option<MeshHandle>,
}

impl MeshComponent {
    pub fn new(path: &str, mesh: MeshHandle) -> Self {
        Self {
            path: path.to_string(),
            mesh: Some(mesh),
        }
    }

    /// Loaded mesh, if the entity should be drawn
    pub fn renderable(&self) -> Option<MeshHandle> {
        if self.path.is_empty() {
            return None;
        }
        self.mesh
    }
}

/// Optional surface description; absence selects the fallback material
#[derive(Component, Debug, Clone)]
pub struct MaterialComponent {
    pub material: Material,
}

impl MaterialComponent {
    pub fn new(material: Material) -> Self {
        Self { material }
    }
}

#[derive(Component, Debug, Clone)]
pub struct CameraComponent {
    pub camera: Camera,
    pub primary: bool,
    pub fixed_aspect_ratio: bool,
}

impl CameraComponent {
    pub fn new(camera: Camera) -> Self {
        Self {
            camera,
            primary: true,
            fixed_aspect_ratio: false,
        }
    }
}

/// Entity container for one editor scene
pub struct Scene {
    name: String,
    world: World,
    environment_path: String,
    viewport: (u32, u32),
}

impl Scene {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            world: World::new(),
            environment_path: String::new(),
            viewport: (0, 0),
        }
    }

    /// Wrap in the shared handle the renderer holds
    pub fn into_shared(self) -> SharedScene {
        Rc::new(RefCell::new(self))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// HDR environment to load when this scene becomes active; empty for none
    pub fn environment_path(&self) -> &str {
        &self.environment_path
    }

    pub fn set_environment_path(&mut self, path: impl Into<String>) {
        self.environment_path = path.into();
    }

    /// Spawn an entity with a tag and an identity transform
    pub fn create_entity(&mut self, name: &str) -> Entity {
        let name = if name.is_empty() { "Entity" } else { name };
        self.world
            .spawn((Tag(name.to_string()), Transform::default()))
            .id()
    }

    /// Spawn a copy of `entity` carrying clones of every known component
    pub fn duplicate_entity(&mut self, entity: Entity) -> Option<Entity> {
        let tag = self.get::<Tag>(entity)?.clone();
        let transform = self.get::<Transform>(entity).copied().unwrap_or_default();
        let camera = self.get::<CameraComponent>(entity).cloned();
        let mesh = self.get::<MeshComponent>(entity).cloned();
        let material = self.get::<MaterialComponent>(entity).cloned();
        let light = self.get::<LightComponent>(entity).cloned();

        let mut copy = self.world.spawn((tag, transform));
        if let Some(camera) = camera {
            copy.insert(camera);
        }
        if let Some(mesh) = mesh {
            copy.insert(mesh);
        }
        if let Some(material) = material {
            copy.insert(material);
        }
        if let Some(light) = light {
            copy.insert(light);
        }
        Some(copy.id())
    }

    pub fn destroy_entity(&mut self, entity: Entity) -> bool {
        self.world.despawn(entity)
    }

    /// Look up an entity by the index written into the picking attachment
    pub fn find_entity(&self, index: u32) -> Option<Entity> {
        self.world
            .iter_entities()
            .map(|e| e.id())
            .find(|e| e.index() == index)
    }

    pub fn entity_count(&self) -> usize {
        self.world.entities().len() as usize
    }

    /// Attach `component`; returns false if the entity doesn't exist
    pub fn insert<C: Component>(&mut self, entity: Entity, component: C) -> bool {
        if !self.world.entities().contains(entity) {
            return false;
        }
        self.world.entity_mut(entity).insert(component);
        true
    }

    pub fn get<C: Component>(&self, entity: Entity) -> Option<&C> {
        self.world.get::<C>(entity)
    }

    pub fn get_mut<C: Component>(&mut self, entity: Entity) -> Option<Mut<'_, C>> {
        self.world.get_mut::<C>(entity)
    }

    /// Propagate a viewport size to every camera without a fixed aspect
    pub fn on_viewport_resize(&mut self, width: u32, height: u32) {
        self.viewport = (width, height);
        let mut cameras = self.world.query::<&mut CameraComponent>();
        for mut component in cameras.iter_mut(&mut self.world) {
            if !component.fixed_aspect_ratio {
                component.camera.set_aspect(width as f32, height as f32);
            }
        }
    }

    pub fn viewport_size(&self) -> (u32, u32) {
        self.viewport
    }

    /// First camera flagged primary
    pub fn primary_camera(&mut self) -> Option<Camera> {
        let mut cameras = self.world.query::<&CameraComponent>();
        cameras
            .iter(&self.world)
            .find(|c| c.primary)
            .map(|c| c.camera.clone())
    }

    /// Visit every entity with a transform and a mesh reference
    pub fn for_each_mesh<F>(&mut self, mut f: F)
    where
        F: FnMut(Entity, &Transform, &MeshComponent, Option<&MaterialComponent>),
    {
        let mut query = self
            .world
            .query::<(Entity, &Transform, &MeshComponent, Option<&MaterialComponent>)>();
        for (entity, transform, mesh, material) in query.iter(&self.world) {
            f(entity, transform, mesh, material);
        }
    }

    /// Visit every entity with a transform and a light
    pub fn for_each_light<F>(&mut self, mut f: F)
    where
        F: FnMut(Entity, &Transform, &LightComponent),
    {
        let mut query = self.world.query::<(Entity, &Transform, &LightComponent)>();
        for (entity, transform, light) in query.iter(&self.world) {
            f(entity, transform, light);
        }
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new("Untitled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_create_entity_has_tag_and_transform() {
        let mut scene = Scene::new("test");
        let e = scene.create_entity("");
        assert_eq!(scene.get::<Tag>(e), Some(&Tag("Entity".to_string())));
        assert_eq!(scene.get::<Transform>(e), Some(&Transform::default()));
    }

    #[test]
    fn test_duplicate_entity_copies_components() {
        let mut scene = Scene::new("test");
        let e = scene.create_entity("lamp");
        scene.insert(e, LightComponent::point(Vec3::X, 2.0, 5.0));
        scene.insert(e, MeshComponent::new("lamp.obj", MeshHandle(7)));

        let copy = scene.duplicate_entity(e).unwrap();
        assert_ne!(copy, e);
        assert_eq!(scene.get::<LightComponent>(copy), scene.get::<LightComponent>(e));
        assert_eq!(scene.get::<MeshComponent>(copy).unwrap().path, "lamp.obj");
        assert!(scene.get::<MaterialComponent>(copy).is_none());
    }

    #[test]
    fn test_destroy_and_find() {
        let mut scene = Scene::new("test");
        let a = scene.create_entity("a");
        let b = scene.create_entity("b");

        assert_eq!(scene.find_entity(b.index()), Some(b));
        assert!(scene.destroy_entity(a));
        assert_eq!(scene.find_entity(a.index()), None);
        assert!(!scene.insert(a, Tag("gone".into())));
        assert_eq!(scene.entity_count(), 1);
    }

    #[test]
    fn test_resize_skips_fixed_aspect_cameras() {
        let mut scene = Scene::new("test");
        let free = scene.create_entity("free");
        let fixed = scene.create_entity("fixed");
        scene.insert(free, CameraComponent::new(Camera::default()));
        let mut pinned = CameraComponent::new(Camera::default());
        pinned.primary = false;
        pinned.fixed_aspect_ratio = true;
        scene.insert(fixed, pinned);

        scene.on_viewport_resize(100, 100);

        let aspect = |c: &CameraComponent| match c.camera.projection {
            Projection::Perspective { aspect, .. } => aspect,
            _ => 0.0,
        };
        assert_eq!(aspect(scene.get::<CameraComponent>(free).unwrap()), 1.0);
        assert!((aspect(scene.get::<CameraComponent>(fixed).unwrap()) - 16.0 / 9.0).abs() < 1e-5);
        assert!(scene.primary_camera().is_some());
    }

    #[test]
    fn test_mesh_renderable() {
        assert_eq!(MeshComponent::default().renderable(), None);
        let pending = MeshComponent {
            path: "cube".into(),
            mesh: None,
        };
        assert_eq!(pending.renderable(), None);
        let empty_path = MeshComponent {
            path: String::new(),
            mesh: Some(MeshHandle(1)),
        };
        assert_eq!(empty_path.renderable(), None);
        assert_eq!(MeshComponent::new("cube", MeshHandle(1)).renderable(), Some(MeshHandle(1)));
    }
}
