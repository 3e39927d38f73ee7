//! Request handlers of the built-in `sw_display` and `sw_registry` objects.

use std::sync::Arc;

use super::client::{RequestContext, RequestHandler};
use crate::error::{Result, SockwireError};
use crate::protocol::{
    self, CALLBACK_DONE, CALLBACK_INTERFACE, REGISTRY_GLOBAL, REGISTRY_INTERFACE,
};
use crate::registry::ResourceHandle;
use crate::wire::{Argument, Message};

fn uint_arg(message: &Message, index: usize) -> Result<u32> {
    message
        .arg(index)
        .and_then(Argument::as_uint)
        .ok_or_else(|| SockwireError::malformed(message.object_id, format!("argument {index} is not a uint")))
}

fn new_id_arg(message: &Message, index: usize) -> Result<u32> {
    message
        .arg(index)
        .and_then(Argument::as_new_id)
        .ok_or_else(|| SockwireError::malformed(message.object_id, format!("argument {index} is not a new id")))
}

/// Handles `sync` and `get_registry`.
pub(crate) struct DisplayHandler;

impl RequestHandler for DisplayHandler {
    fn request(
        &mut self,
        cx: &mut RequestContext<'_>,
        resource: ResourceHandle,
        message: Message,
    ) -> Result<()> {
        match message.opcode {
            protocol::DISPLAY_SYNC => {
                let id = new_id_arg(&message, 0)?;
                let callback = cx.client.create_resource(&CALLBACK_INTERFACE, 1, id);
                let serial = cx.display.serial();
                cx.client
                    .post_event(callback, CALLBACK_DONE, &[Argument::Uint(serial)])?;
                cx.client.destroy_resource(callback)
            }
            protocol::DISPLAY_GET_REGISTRY => {
                let id = new_id_arg(&message, 0)?;
                let registry = cx.client.create_resource(&REGISTRY_INTERFACE, 1, id);
                cx.client
                    .set_implementation(registry, RegistryHandler, None, None)?;
                cx.client.add_registry(registry);

                for global in cx.display.globals().iter_advertised() {
                    cx.client.post_event(
                        registry,
                        REGISTRY_GLOBAL,
                        &[
                            Argument::Uint(global.name()),
                            Argument::string(global.interface().name),
                            Argument::Uint(global.version()),
                        ],
                    )?;
                }
                Ok(())
            }
            opcode => Err(SockwireError::InvalidMethod {
                id: resource.id(),
                interface: protocol::DISPLAY_INTERFACE.name,
                opcode,
            }),
        }
    }
}

/// Handles `bind`.
pub(crate) struct RegistryHandler;

impl RequestHandler for RegistryHandler {
    fn request(
        &mut self,
        cx: &mut RequestContext<'_>,
        resource: ResourceHandle,
        message: Message,
    ) -> Result<()> {
        if message.opcode != protocol::REGISTRY_BIND {
            return Err(SockwireError::InvalidMethod {
                id: resource.id(),
                interface: REGISTRY_INTERFACE.name,
                opcode: message.opcode,
            });
        }

        let name = uint_arg(&message, 0)?;
        let interface_name = message.arg(1).and_then(Argument::as_str).unwrap_or_default();
        let version = uint_arg(&message, 2)?;
        let id = new_id_arg(&message, 3)?;

        let invalid = |message: String| SockwireError::InvalidObject {
            id: resource.id(),
            message,
        };

        let Some(global) = cx.display.globals().get(name) else {
            return Err(invalid(format!("invalid global {interface_name} ({name})")));
        };
        if global.interface().name != interface_name {
            return Err(invalid(format!(
                "invalid interface for global {name}: have {interface_name}, wanted {}",
                global.interface().name
            )));
        }
        if version == 0 || version > global.version() {
            return Err(invalid(format!(
                "invalid version for global {interface_name} ({name}): have {version}, wanted 1 to {}",
                global.version()
            )));
        }

        if global.is_removed() {
            // Withdrawn but not destroyed: the bind succeeds with an object
            // that ignores everything.
            let inert = cx.client.create_resource(global.interface(), version, id);
            return cx.client.set_inert(inert);
        }

        let bind = Arc::clone(global.bind());
        let bound = bind(cx.client, version, id)?;
        cx.display.record_binding(name, cx.client.id(), bound);
        Ok(())
    }
}
